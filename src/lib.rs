//! # gzseek
//!
//! Random access into gzip files through a checkpoint index, for local files
//! and for remote files served over HTTP Range requests.
//!
//! A gzip stream can normally only be decoded from the start. `gzseek` makes
//! one linear pass over the source and records, roughly every
//! `span_bytes` of output, enough decoder state to resume from that point:
//! the bit offset, the last 32 KiB of output and, when the point lies inside
//! a Huffman block, that block's code lengths. The resulting [`Index`] can be
//! saved next to the source and reused for any number of extractions.
//!
//! ## Features
//!
//! - Multi-member gzip files, exposed as one continuous uncompressed stream
//! - Checkpoints at any bit position, including the middle of long blocks
//! - Exactly one checkpoint-bounded fetch per extraction
//! - Compact, self-checking sidecar format with atomic saves
//! - Detection of a changed source before stale data is served
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gzseek::{HttpRangeReader, IndexBuilder, RangeExtractor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = Arc::new(HttpRangeReader::new("https://example.com/logs.gz".to_string()).await?);
//!
//!     let index = IndexBuilder::new(1 << 20).build(Arc::clone(&reader)).await?;
//!     gzseek::index::save_to_path(&index, std::path::Path::new("logs.gz.gzrx")).await?;
//!
//!     let bytes = RangeExtractor::new(&index, reader).extract(10_000_000, 4096).await?;
//!     print!("{}", String::from_utf8_lossy(&bytes));
//!     Ok(())
//! }
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

pub mod cli;
pub mod deflate;
pub mod error;
pub mod extractor;
pub mod gzip;
pub mod index;
pub mod io;

pub use cli::Cli;
pub use error::{Error, Result};
pub use extractor::{ExtractOptions, RangeExtractor};
pub use index::{Checkpoint, DEFAULT_SPAN, Index, IndexBuilder};
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt};

/// Build an index over every member of `reader` with a checkpoint about
/// every `span_bytes` of uncompressed output.
pub async fn build_index<R: ReadAt + 'static>(reader: Arc<R>, span_bytes: u64) -> Result<Index> {
    IndexBuilder::new(span_bytes).build(reader).await
}

pub fn save_index<W: Write>(index: &Index, writer: W) -> Result<()> {
    index::save(index, writer)
}

pub fn load_index<R: Read>(reader: R) -> Result<Index> {
    index::load(reader)
}

/// Return uncompressed bytes `[start, start + length)` of the source.
pub async fn extract_range<R: ReadAt + ?Sized>(
    index: &Index,
    reader: Arc<R>,
    start: u64,
    length: u64,
) -> Result<Vec<u8>> {
    RangeExtractor::new(index, reader).extract(start, length).await
}
