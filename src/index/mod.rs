//! Checkpoint index over a gzip source.
//!
//! ## Architecture
//!
//! - [`recorder`]: decides where checkpoints go during the forward pass
//! - [`builder`]: drives the pass over every member of a source
//! - [`store`]: binary sidecar format and atomic persistence
//!
//! An [`Index`] maps one continuous uncompressed offset space onto resume
//! points in the compressed stream. Member `k + 1` starts right after member
//! `k`'s last byte.

mod builder;
mod recorder;
mod store;

pub use builder::{DEFAULT_SPAN, IndexBuilder};
pub use recorder::CheckpointRecorder;
pub use store::{
    FORMAT_VERSION, INDEX_MAGIC, load, load_for_source, load_from_path, save, save_to_path,
};

use std::ops::Range;

use crate::deflate::{BlockState, WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::io::ReadAt;

const VERIFY_CHUNK: u64 = 4 << 20;

/// A saved decoder state from which decoding can resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Offset in the continuous uncompressed stream.
    pub uncompressed_offset: u64,
    /// Absolute bit position in the compressed source.
    pub compressed_bit_offset: u64,
    /// Last `min(32768, offset within member)` output bytes before this point.
    pub window: Vec<u8>,
    pub member_id: u32,
    pub block: BlockState,
}

impl Checkpoint {
    /// First compressed byte needed to resume here.
    pub fn compressed_byte(&self) -> u64 {
        self.compressed_bit_offset / 8
    }

    /// First compressed byte that can be skipped when decoding up to here.
    pub fn compressed_byte_ceil(&self) -> u64 {
        self.compressed_bit_offset.div_ceil(8)
    }
}

/// Checkpoints of a single member, with offsets relative to the member start.
#[derive(Debug, Clone)]
pub struct MemberIndex {
    pub member_id: u32,
    /// Compressed bytes covered by this member, header and trailer included.
    pub compressed_range: Range<u64>,
    pub uncompressed_len: u64,
    pub checkpoints: Vec<Checkpoint>,
}

/// Immutable checkpoint table for one version of a gzip source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    source_byte_size: u64,
    uncompressed_byte_size: u64,
    span_bytes: u64,
    source_checksum: u64,
    checkpoints: Vec<Checkpoint>,
}

impl Index {
    /// Assemble an index from its parts, checking every invariant.
    pub(crate) fn from_parts(
        source_byte_size: u64,
        uncompressed_byte_size: u64,
        span_bytes: u64,
        source_checksum: u64,
        checkpoints: Vec<Checkpoint>,
    ) -> std::result::Result<Self, String> {
        let index = Self {
            source_byte_size,
            uncompressed_byte_size,
            span_bytes,
            source_checksum,
            checkpoints,
        };
        index.validate()?;
        Ok(index)
    }

    /// Merge per-member results, in member order, into one offset space.
    pub(crate) fn from_members(
        members: Vec<MemberIndex>,
        source_byte_size: u64,
        span_bytes: u64,
        source_checksum: u64,
    ) -> Result<Self> {
        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        let mut base = 0u64;
        let mut first_start = None;

        for member in members {
            // An empty member has no bytes to resume into.
            if member.uncompressed_len == 0 {
                if first_start.is_none() {
                    first_start = member.checkpoints.into_iter().next();
                }
                continue;
            }
            for mut cp in member.checkpoints {
                cp.uncompressed_offset += base;
                checkpoints.push(cp);
            }
            base += member.uncompressed_len;
        }
        // A source made only of empty members still gets its start checkpoint.
        if checkpoints.is_empty() {
            checkpoints.extend(first_start);
        }

        Self::from_parts(source_byte_size, base, span_bytes, source_checksum, checkpoints)
            .map_err(|e| Error::malformed(format!("inconsistent index: {e}")))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let first = self
            .checkpoints
            .first()
            .ok_or_else(|| "index has no checkpoints".to_string())?;
        if first.uncompressed_offset != 0 {
            return Err("first checkpoint is not at offset 0".into());
        }

        let mut member_start = 0u64;
        let mut member_id = first.member_id;
        for (i, cp) in self.checkpoints.iter().enumerate() {
            if i > 0 {
                let prev = &self.checkpoints[i - 1];
                if cp.uncompressed_offset <= prev.uncompressed_offset
                    || cp.compressed_bit_offset <= prev.compressed_bit_offset
                {
                    return Err(format!("checkpoint {i} is not strictly increasing"));
                }
                if cp.member_id < prev.member_id {
                    return Err(format!("checkpoint {i} goes back to an earlier member"));
                }
            }
            if cp.member_id != member_id {
                if !cp.window.is_empty() || cp.block != BlockState::Boundary {
                    return Err(format!("checkpoint {i} does not start its member"));
                }
                member_id = cp.member_id;
                member_start = cp.uncompressed_offset;
            }
            if cp.uncompressed_offset >= self.uncompressed_byte_size
                && self.uncompressed_byte_size > 0
            {
                return Err(format!("checkpoint {i} lies past the end of the data"));
            }
            if cp.compressed_byte() >= self.source_byte_size {
                return Err(format!("checkpoint {i} lies past the end of the source"));
            }
            let expected = (cp.uncompressed_offset - member_start).min(WINDOW_SIZE as u64);
            if cp.window.len() as u64 != expected {
                return Err(format!(
                    "checkpoint {i} has a {} byte window, expected {}",
                    cp.window.len(),
                    expected
                ));
            }
            if matches!(cp.block, BlockState::Stored { .. }) && cp.compressed_bit_offset % 8 != 0 {
                return Err(format!("checkpoint {i} is inside a stored block but not byte aligned"));
            }
        }
        Ok(())
    }

    pub fn source_byte_size(&self) -> u64 {
        self.source_byte_size
    }

    pub fn uncompressed_byte_size(&self) -> u64 {
        self.uncompressed_byte_size
    }

    pub fn span_bytes(&self) -> u64 {
        self.span_bytes
    }

    pub fn source_checksum(&self) -> u64 {
        self.source_checksum
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Number of members that own at least one checkpoint.
    pub fn member_count(&self) -> usize {
        let mut count = 0;
        let mut last = None;
        for cp in &self.checkpoints {
            if last != Some(cp.member_id) {
                count += 1;
                last = Some(cp.member_id);
            }
        }
        count
    }

    /// Position of the checkpoint with the largest offset `<= offset`.
    pub fn checkpoint_for(&self, offset: u64) -> usize {
        self.checkpoints
            .partition_point(|cp| cp.uncompressed_offset <= offset)
            .saturating_sub(1)
    }

    /// Fail with `IndexMismatch` unless `reader` holds the bytes this index
    /// was built from. Reads the whole source.
    pub async fn verify_source<R: ReadAt + ?Sized>(&self, reader: &R) -> Result<()> {
        let size = reader.size();
        if size != self.source_byte_size {
            return Err(self.mismatch(size, 0));
        }

        let mut hasher = crc32fast::Hasher::new();
        let mut pos = 0u64;
        while pos < size {
            let end = (pos + VERIFY_CHUNK).min(size);
            let chunk = reader
                .fetch(pos, end)
                .await
                .map_err(|e| Error::fetch(pos, end, e))?;
            hasher.update(&chunk);
            pos = end;
        }

        let checksum = hasher.finalize() as u64;
        if checksum != self.source_checksum {
            return Err(self.mismatch(size, checksum));
        }
        Ok(())
    }

    /// Cheap check that only compares sizes.
    pub fn check_source_size(&self, size: u64) -> Result<()> {
        if size != self.source_byte_size {
            return Err(self.mismatch(size, 0));
        }
        Ok(())
    }

    fn mismatch(&self, actual_size: u64, actual_checksum: u64) -> Error {
        Error::IndexMismatch {
            expected_size: self.source_byte_size,
            expected_checksum: self.source_checksum,
            actual_size,
            actual_checksum,
        }
    }
}
