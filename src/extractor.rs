//! Random-access extraction of uncompressed byte ranges.

use std::sync::Arc;
use std::time::Duration;

use crate::deflate::{BlockState, Inflater};
use crate::error::{Error, Result};
use crate::index::{Checkpoint, Index};
use crate::io::ReadAt;

const DECODE_CHUNK: u64 = 64 * 1024;

/// Per-call extraction settings.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Upper bound on a single compressed fetch. `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
}

/// Extracts byte ranges using an [`Index`] and a compressed range accessor.
///
/// Each call to [`extract`](Self::extract) owns its own decoder, so one
/// extractor (or many sharing the same index) can serve concurrent calls.
pub struct RangeExtractor<'a, R: ?Sized> {
    index: &'a Index,
    reader: Arc<R>,
    options: ExtractOptions,
}

impl<'a, R: ReadAt + ?Sized> RangeExtractor<'a, R> {
    pub fn new(index: &'a Index, reader: Arc<R>) -> Self {
        Self {
            index,
            reader,
            options: ExtractOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    /// Return uncompressed bytes `[start, start + length)`.
    ///
    /// The source is only compared with the index by size here. Use
    /// [`Index::verify_source`] or [`crate::index::load_for_source`] to catch a
    /// same-size edit before extracting.
    pub async fn extract(&self, start: u64, length: u64) -> Result<Vec<u8>> {
        let index = self.index;
        let source_size = self.reader.size();
        index.check_source_size(source_size)?;

        let size = index.uncompressed_byte_size();
        let end = start
            .checked_add(length)
            .filter(|&end| end <= size)
            .ok_or(Error::OutOfRange {
                start,
                length,
                size,
            })?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let checkpoints = index.checkpoints();
        let first = index.checkpoint_for(start);
        let last = index.checkpoint_for(end - 1);
        let from = checkpoints[first].compressed_byte();
        let bound = checkpoints
            .get(last + 1)
            .map_or(source_size, Checkpoint::compressed_byte_ceil);

        let data = self.fetch(from, bound).await?;
        match decode_range(&checkpoints[first..], from, &data, start, end) {
            Err(err @ (Error::TruncatedInput | Error::MalformedStream(_))) if bound < source_size => {
                tracing::warn!(
                    from,
                    bound,
                    error = %err,
                    "checkpoint-bounded range was not enough, fetching to end of source"
                );
                let data = self.fetch(from, source_size).await?;
                decode_range(&checkpoints[first..], from, &data, start, end)
            }
            result => result,
        }
    }

    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        tracing::debug!(start, end, "fetching compressed range");
        let fetch = self.reader.fetch(start, end);
        let fetched = match self.options.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| {
                Error::Aborted(format!("fetch of {start}..{end} timed out after {limit:?}"))
            })?,
            None => fetch.await,
        };
        fetched.map_err(|e| Error::fetch(start, end, e))
    }
}

/// Decode `[start, end)` from compressed bytes that begin at absolute byte `base`.
///
/// `checkpoints[0]` is the resume point; later entries are consulted only to
/// cross into the next member.
fn decode_range(
    checkpoints: &[Checkpoint],
    base: u64,
    data: &[u8],
    start: u64,
    end: u64,
) -> Result<Vec<u8>> {
    let mut current = &checkpoints[0];
    let mut inflater = open(current, base, data)?;
    let mut pos = current.uncompressed_offset;
    let mut out = Vec::with_capacity((end - start) as usize);

    while pos < end {
        // Never let a chunk straddle `start`.
        let want = (if pos < start { start - pos } else { end - pos }).min(DECODE_CHUNK);
        let chunk = inflater.next_bytes(want as usize)?;
        if chunk.is_empty() {
            // Member ended before the range did.
            current = checkpoints
                .iter()
                .find(|cp| {
                    cp.uncompressed_offset == pos
                        && cp.block == BlockState::Boundary
                        && cp.compressed_bit_offset > current.compressed_bit_offset
                })
                .ok_or_else(|| {
                    Error::corrupt(format!("no checkpoint at member boundary {pos}"))
                })?;
            tracing::debug!(member = current.member_id, offset = pos, "crossing into next member");
            inflater = open(current, base, data)?;
            continue;
        }
        if pos >= start {
            out.extend_from_slice(chunk);
        }
        pos += chunk.len() as u64;
    }

    Ok(out)
}

fn open<'d>(checkpoint: &Checkpoint, base: u64, data: &'d [u8]) -> Result<Inflater<&'d [u8]>> {
    let offset = checkpoint
        .compressed_byte()
        .checked_sub(base)
        .ok_or_else(|| Error::corrupt("checkpoint precedes the fetched range"))?;
    let input = data.get(offset as usize..).ok_or(Error::TruncatedInput)?;
    Inflater::resume(input, checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexBuilder;
    use crate::io::MemoryReader;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::ops::Range;
    use std::sync::Mutex;

    /// Records every fetched range, optionally serving nothing past `clip`.
    struct Recording {
        inner: MemoryReader,
        fetches: Mutex<Vec<Range<u64>>>,
        clip: Option<u64>,
    }

    #[async_trait]
    impl ReadAt for Recording {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> AnyResult<usize> {
            self.inner.read_at(offset, buf).await
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        async fn fetch(&self, start: u64, end: u64) -> AnyResult<Vec<u8>> {
            self.fetches.lock().unwrap().push(start..end);
            let end = self.clip.map_or(end, |clip| end.min(clip));
            self.inner.fetch(start, end).await
        }
    }

    struct Stalled(u64);

    #[async_trait]
    impl ReadAt for Stalled {
        async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> AnyResult<usize> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(0)
        }

        fn size(&self) -> u64 {
            self.0
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn numbers(count: u32) -> Vec<u8> {
        (0..count).flat_map(|i| format!("{i:08}\n").into_bytes()).collect()
    }

    async fn indexed(data: &[u8], span: u64) -> (Index, Arc<Recording>) {
        let reader = Arc::new(Recording {
            inner: MemoryReader::new(gzip(data)),
            fetches: Mutex::new(Vec::new()),
            clip: None,
        });
        let index = IndexBuilder::new(span).build(Arc::clone(&reader)).await.unwrap();
        reader.fetches.lock().unwrap().clear();
        (index, reader)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extracts_with_one_bounded_fetch() {
        let data = numbers(50_000);
        let (index, reader) = indexed(&data, 40_000).await;
        let extractor = RangeExtractor::new(&index, Arc::clone(&reader));

        let got = extractor.extract(123_456, 1000).await.unwrap();
        assert_eq!(got, &data[123_456..124_456]);

        let fetches = reader.fetches.lock().unwrap().clone();
        assert_eq!(fetches.len(), 1);
        let cps = index.checkpoints();
        let c = index.checkpoint_for(123_456);
        assert_eq!(fetches[0].start, cps[c].compressed_byte());
        assert_eq!(fetches[0].end, cps[c + 1].compressed_byte_ceil());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn range_spanning_checkpoints_is_stitched() {
        let data = numbers(30_000);
        let (index, reader) = indexed(&data, 10_000).await;
        let extractor = RangeExtractor::new(&index, reader);

        let at = index.checkpoints()[3].uncompressed_offset;
        let got = extractor.extract(at - 5000, 25_000).await.unwrap();
        assert_eq!(got, &data[(at - 5000) as usize..(at + 20_000) as usize]);

        let tail = extractor.extract(data.len() as u64 - 7, 7).await.unwrap();
        assert_eq!(tail, &data[data.len() - 7..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn boundaries() {
        let data = numbers(1000);
        let (index, reader) = indexed(&data, 1024).await;
        let extractor = RangeExtractor::new(&index, reader);
        let size = data.len() as u64;

        assert!(extractor.extract(0, 0).await.unwrap().is_empty());
        assert!(extractor.extract(size, 0).await.unwrap().is_empty());
        assert!(matches!(
            extractor.extract(size, 1).await,
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            extractor.extract(u64::MAX, 2).await,
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(extractor.extract(0, size).await.unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wrong_source_size_is_a_mismatch() {
        let data = numbers(1000);
        let (index, _) = indexed(&data, 1024).await;
        let other = Arc::new(MemoryReader::new(gzip(b"something else")));
        assert!(matches!(
            RangeExtractor::new(&index, other).extract(0, 1).await,
            Err(Error::IndexMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_fetch_is_aborted() {
        let data = numbers(1000);
        let gz = gzip(&data);
        let index = IndexBuilder::new(1024)
            .build(Arc::new(MemoryReader::new(gz.clone())))
            .await
            .unwrap();

        let extractor = RangeExtractor::new(&index, Arc::new(Stalled(gz.len() as u64)))
            .with_options(ExtractOptions {
                fetch_timeout: Some(Duration::from_millis(20)),
            });
        let err = extractor.extract(10, 10).await.unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn understated_bound_is_widened_once() {
        let data = numbers(50_000);
        let (index, reader) = indexed(&data, 40_000).await;
        let mut cps = index.checkpoints().to_vec();
        assert!(cps.len() > 3);
        cps[2].compressed_bit_offset = cps[1].compressed_bit_offset + 64;
        let skewed = Index::from_parts(
            index.source_byte_size(),
            index.uncompressed_byte_size(),
            index.span_bytes(),
            index.source_checksum(),
            cps.clone(),
        )
        .unwrap();

        let start = cps[1].uncompressed_offset + 10_000;
        let got = RangeExtractor::new(&skewed, Arc::clone(&reader))
            .extract(start, 1000)
            .await
            .unwrap();
        assert_eq!(got, &data[start as usize..start as usize + 1000]);

        let fetches = reader.fetches.lock().unwrap().clone();
        assert_eq!(fetches.len(), 2);
        assert_eq!(fetches[0].end, cps[2].compressed_byte_ceil());
        assert_eq!(fetches[1].start, cps[1].compressed_byte());
        assert_eq!(fetches[1].end, reader.size());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn short_read_at_end_of_source_fails() {
        let data = numbers(20_000);
        let gz = gzip(&data);
        let size = gz.len() as u64;
        let index = IndexBuilder::new(1 << 30)
            .build(Arc::new(MemoryReader::new(gz.clone())))
            .await
            .unwrap();
        assert_eq!(index.checkpoints().len(), 1);

        let reader = Arc::new(Recording {
            inner: MemoryReader::new(gz),
            fetches: Mutex::new(Vec::new()),
            clip: Some(size / 2),
        });
        let err = RangeExtractor::new(&index, Arc::clone(&reader))
            .extract(data.len() as u64 - 100, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TruncatedInput));
        assert_eq!(reader.fetches.lock().unwrap().len(), 1);
    }

    #[test]
    fn short_buffer_is_truncated() {
        let data = numbers(2000);
        let gz = gzip(&data);
        let start = Checkpoint {
            uncompressed_offset: 0,
            compressed_bit_offset: 80,
            window: Vec::new(),
            member_id: 0,
            block: BlockState::Boundary,
        };
        let cut = &gz[10..gz.len() / 2];
        assert!(matches!(
            decode_range(std::slice::from_ref(&start), 10, cut, 0, data.len() as u64),
            Err(Error::TruncatedInput)
        ));
        let got = decode_range(std::slice::from_ref(&start), 10, &gz[10..], 100, 200).unwrap();
        assert_eq!(got, &data[100..200]);
    }
}
