use std::io::Read;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;
use tokio::task::JoinError;

use super::recorder::CheckpointRecorder;
use super::{Index, MemberIndex};
use crate::deflate::{BitReader, Inflater};
use crate::error::{Error, Result};
use crate::gzip::{GzipHeader, GzipTrailer};
use crate::io::{BlockingReader, ReadAt};

/// Default spacing between checkpoints (1 MiB of uncompressed output).
pub const DEFAULT_SPAN: u64 = 1 << 20;

/// Largest chunk requested from the decoder in one call.
const DECODE_CHUNK: u64 = 64 * 1024;

/// Builds an [`Index`] with one linear pass over a gzip source.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    span: u64,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self { span: DEFAULT_SPAN }
    }
}

impl IndexBuilder {
    pub fn new(span: u64) -> Self {
        Self { span }
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    /// Index every member of `reader`.
    ///
    /// Decoding runs on a blocking worker thread; the source is read once,
    /// front to back, and hashed along the way.
    pub async fn build<R: ReadAt + 'static>(&self, reader: Arc<R>) -> Result<Index> {
        self.check_span()?;
        let span = self.span;
        let size = reader.size();
        let handle = Handle::current();

        let (members, checksum) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut source = BlockingReader::new(reader, handle, 0..size);
            let members = index_members(&mut source, span)?;
            source.drain()?;
            Ok((members, source.into_hasher().finalize()))
        })
        .await
        .map_err(worker_failed)??;

        finish(members, size, span, checksum as u64)
    }

    /// Index members whose byte ranges are already known, one task per member.
    ///
    /// `member_ranges` must be contiguous, cover the whole source, and each
    /// hold exactly one gzip member. The result is identical to [`build`](Self::build).
    pub async fn build_members<R: ReadAt + 'static>(
        &self,
        reader: Arc<R>,
        member_ranges: Vec<Range<u64>>,
    ) -> Result<Index> {
        self.check_span()?;
        let span = self.span;
        let size = reader.size();
        check_ranges(&member_ranges, size)?;

        let handle = Handle::current();
        let cancel = Arc::new(AtomicBool::new(false));
        let tasks: Vec<_> = member_ranges
            .into_iter()
            .enumerate()
            .map(|(id, range)| {
                let reader = Arc::clone(&reader);
                let handle = handle.clone();
                let cancel = Arc::clone(&cancel);
                tokio::task::spawn_blocking(move || {
                    index_range(reader, handle, range, id as u32, span, cancel)
                })
            })
            .collect();

        // Merge strictly in member order once every worker is done.
        let mut members = Vec::with_capacity(tasks.len());
        let mut hasher = crc32fast::Hasher::new();
        let mut pending = tasks.into_iter();
        while let Some(task) = pending.next() {
            match task.await.map_err(worker_failed).and_then(|r| r) {
                Ok((member, member_hasher)) => {
                    hasher.combine(&member_hasher);
                    members.push(member);
                }
                Err(err) => {
                    // Stop the remaining workers and wait for them to wind down.
                    cancel.store(true, Ordering::Relaxed);
                    let rest: Vec<_> = pending.by_ref().collect();
                    for task in &rest {
                        task.abort();
                    }
                    for task in rest {
                        let _ = task.await;
                    }
                    tracing::warn!(member = members.len(), "member indexing failed: {}", err);
                    return Err(err);
                }
            }
        }

        finish(members, size, span, hasher.finalize() as u64)
    }

    fn check_span(&self) -> Result<()> {
        if self.span == 0 {
            return Err(Error::InvalidArgument("span must be at least one byte".into()));
        }
        Ok(())
    }
}

fn finish(members: Vec<MemberIndex>, size: u64, span: u64, checksum: u64) -> Result<Index> {
    let member_count = members.len();
    let index = Index::from_members(members, size, span, checksum)?;
    tracing::info!(
        members = member_count,
        checkpoints = index.checkpoints().len(),
        compressed = size,
        uncompressed = index.uncompressed_byte_size(),
        "index built"
    );
    Ok(index)
}

fn worker_failed(err: JoinError) -> Error {
    Error::Aborted(format!("index worker failed: {err}"))
}

fn check_ranges(ranges: &[Range<u64>], size: u64) -> Result<()> {
    if ranges.is_empty() {
        return Err(Error::InvalidArgument("no member ranges given".into()));
    }
    let mut expected = 0u64;
    for range in ranges {
        if range.start != expected || range.end <= range.start {
            return Err(Error::InvalidArgument(format!(
                "member range {}..{} does not continue at {}",
                range.start, range.end, expected
            )));
        }
        expected = range.end;
    }
    if expected != size {
        return Err(Error::InvalidArgument(format!(
            "member ranges end at {} but the source has {} bytes",
            expected, size
        )));
    }
    Ok(())
}

fn index_range<R: ReadAt>(
    reader: Arc<R>,
    handle: Handle,
    range: Range<u64>,
    member_id: u32,
    span: u64,
    cancel: Arc<AtomicBool>,
) -> Result<(MemberIndex, crc32fast::Hasher)> {
    let (start, end) = (range.start, range.end);
    let mut source = BlockingReader::new(reader, handle, range).with_cancel(cancel);

    let input = BitReader::new(&mut source, start);
    let (member, mut rest) = index_member(input, member_id, span)?;
    if !rest.at_eof()? {
        return Err(Error::malformed(format!(
            "range {start}..{end} holds more than one member"
        )));
    }
    drop(rest);

    source.drain()?;
    Ok((member, source.into_hasher()))
}

/// Index every member of a gzip stream read front to back.
pub(crate) fn index_members<R: Read>(source: R, span: u64) -> Result<Vec<MemberIndex>> {
    let mut input = BitReader::new(source, 0);
    let mut members = Vec::new();

    loop {
        match input.peek_byte()? {
            None if members.is_empty() => return Err(Error::malformed("empty input")),
            None => break,
            Some(0) if !members.is_empty() => {
                skip_padding(&mut input)?;
                break;
            }
            Some(_) => {}
        }

        let member_id = u32::try_from(members.len())
            .map_err(|_| Error::malformed("too many gzip members"))?;
        let (member, next) = index_member(input, member_id, span)?;
        input = next;
        members.push(member);
    }

    Ok(members)
}

fn skip_padding<R: Read>(input: &mut BitReader<R>) -> Result<()> {
    let mut padding = 0u64;
    while let Some(byte) = input.read_aligned_byte()? {
        if byte != 0 {
            return Err(Error::malformed(format!(
                "trailing garbage after last member at byte {}",
                input.bit_position() / 8 - 1
            )));
        }
        padding += 1;
    }
    tracing::warn!(bytes = padding, "ignoring zero padding after last member");
    Ok(())
}

/// Decode one member, recording checkpoints, and hand back the input
/// positioned right after its trailer.
fn index_member<R: Read>(
    mut input: BitReader<R>,
    member_id: u32,
    span: u64,
) -> Result<(MemberIndex, BitReader<R>)> {
    let start = input.bit_position() / 8;
    let header = GzipHeader::read(&mut input)?;
    tracing::debug!(
        member = member_id,
        offset = start,
        header_len = header.len,
        name = header.file_name.as_deref().unwrap_or(""),
        "member header"
    );

    let mut recorder = CheckpointRecorder::new(span);
    recorder.begin_member(member_id, input.bit_position());
    let mut inflater = Inflater::new(input);
    let mut crc = crc32fast::Hasher::new();

    loop {
        if recorder.is_due() {
            if let Some(state) = inflater.resume_state() {
                recorder.record(inflater.bit_position(), state);
            }
        }
        if inflater.is_done() {
            break;
        }
        // Finish a cut-short match first so the next checkpoint lands on a symbol.
        let want = if recorder.is_due() {
            inflater.pending_len().max(1)
        } else {
            recorder.until_due().min(DECODE_CHUNK) as usize
        };
        let chunk = inflater.next_bytes(want)?;
        if chunk.is_empty() {
            break;
        }
        crc.update(chunk);
        recorder.observe(chunk);
    }

    let mut input = inflater.finish()?;
    let trailer = GzipTrailer::read(&mut input)?;
    let len = recorder.produced();
    trailer.verify(crc.finalize(), len)?;
    let end = input.bit_position() / 8;

    let checkpoints = recorder.finish_member();
    tracing::debug!(
        member = member_id,
        uncompressed = len,
        checkpoints = checkpoints.len(),
        "member indexed"
    );
    Ok((
        MemberIndex {
            member_id,
            compressed_range: start..end,
            uncompressed_len: len,
            checkpoints,
        },
        input,
    ))
}
