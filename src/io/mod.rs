mod blocking;
mod http;
mod local;
mod memory;

pub use blocking::BlockingReader;
pub use http::{HttpConfig, HttpRangeReader};
pub use local::LocalFileReader;
pub use memory::MemoryReader;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Trait for random access reading from a compressed source.
///
/// This is the only thing the index builder and range extractor need from
/// their environment. Retry policy belongs to the implementation.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fetch exactly the bytes `[start, end)`.
    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        if start > end || end > self.size() {
            bail!(
                "range {}..{} is outside the source ({} bytes)",
                start,
                end,
                self.size()
            );
        }

        let mut buf = vec![0u8; (end - start) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read_at(start + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                bail!("source ended at {} while fetching {}..{}", start + filled as u64, start, end);
            }
            filled += n;
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_returns_exact_range() {
        let reader = MemoryReader::new((0u8..100).collect::<Vec<_>>());
        let bytes = reader.fetch(10, 20).await.unwrap();
        assert_eq!(bytes, (10u8..20).collect::<Vec<_>>());
        assert!(reader.fetch(20, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_rejects_range_past_end() {
        let reader = MemoryReader::new(vec![0u8; 8]);
        assert!(reader.fetch(4, 9).await.is_err());
        assert!(reader.fetch(5, 4).await.is_err());
    }
}
