use std::io::{self, Read};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;

use super::ReadAt;
use crate::error::Error;

const READ_CHUNK: usize = 1 << 20;

/// Sequential, blocking `Read` over a byte range of an async [`ReadAt`].
///
/// Must be driven from a blocking thread (`spawn_blocking`), never from an
/// async task. Every byte handed out is folded into a CRC-32.
pub struct BlockingReader<R: ReadAt> {
    inner: Arc<R>,
    handle: Handle,
    pos: u64,
    end: u64,
    buf: Vec<u8>,
    head: usize,
    hasher: crc32fast::Hasher,
    cancel: Option<Arc<AtomicBool>>,
}

impl<R: ReadAt> BlockingReader<R> {
    pub fn new(inner: Arc<R>, handle: Handle, range: Range<u64>) -> Self {
        Self {
            inner,
            handle,
            pos: range.start,
            end: range.end,
            buf: Vec::new(),
            head: 0,
            hasher: crc32fast::Hasher::new(),
            cancel: None,
        }
    }

    /// Read and hash whatever is left of the range.
    pub fn drain(&mut self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut scratch = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut scratch)?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    /// Stop with [`Error::Aborted`] at the next refill once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn into_hasher(self) -> crc32fast::Hasher {
        self.hasher
    }

    fn refill(&mut self) -> io::Result<()> {
        if self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(Error::Aborted(format!("read of {}..{} cancelled", self.pos, self.end)).into_io());
        }
        let want = ((self.end - self.pos) as usize).min(READ_CHUNK);
        let start = self.pos;
        let end = start + want as u64;
        let inner = Arc::clone(&self.inner);
        let data = self
            .handle
            .block_on(async move { inner.fetch(start, end).await })
            .map_err(|e| Error::fetch(start, end, e).into_io())?;
        self.pos = end;
        self.buf = data;
        self.head = 0;
        Ok(())
    }
}

impl<R: ReadAt> Read for BlockingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.head >= self.buf.len() {
            if self.pos >= self.end {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = out.len().min(self.buf.len() - self.head);
        let chunk = &self.buf[self.head..self.head + n];
        out[..n].copy_from_slice(chunk);
        self.hasher.update(chunk);
        self.head += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_range_and_hashes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let expected = crc32fast::hash(&data[100..4000]);
        let reader = Arc::new(MemoryReader::new(data.clone()));
        let handle = Handle::current();

        let (bytes, crc) = tokio::task::spawn_blocking(move || {
            let mut r = BlockingReader::new(reader, handle, 100..4000);
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            (out, r.into_hasher().finalize())
        })
        .await
        .unwrap();

        assert_eq!(bytes, &data[100..4000]);
        assert_eq!(crc, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_reader_stops() {
        let reader = Arc::new(MemoryReader::new(vec![7u8; 3 * READ_CHUNK]));
        let handle = Handle::current();
        let flag = Arc::new(AtomicBool::new(false));
        let cancel = Arc::clone(&flag);

        let (first, second) = tokio::task::spawn_blocking(move || {
            let mut r = BlockingReader::new(reader, handle, 0..3 * READ_CHUNK as u64)
                .with_cancel(cancel);
            let mut out = vec![0u8; READ_CHUNK];
            let first = r.read(&mut out).unwrap();
            flag.store(true, Ordering::Relaxed);
            (first, r.read(&mut out).map_err(Error::from))
        })
        .await
        .unwrap();

        assert_eq!(first, READ_CHUNK);
        assert!(matches!(second, Err(Error::Aborted(_))));
    }
}
