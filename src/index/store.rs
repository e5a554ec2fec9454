//! Binary sidecar format for [`Index`].
//!
//! All integers are little-endian. The file ends with a CRC-32 of every
//! byte before it, so a torn or bit-flipped file is always rejected.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::{Checkpoint, Index};
use crate::deflate::{BlockState, WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::io::ReadAt;

pub const INDEX_MAGIC: [u8; 4] = *b"GZRX";
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 * 5;
const TRAILER_LEN: usize = 4;
/// Smallest possible encoded checkpoint (boundary block, empty window).
const MIN_CHECKPOINT_LEN: usize = 8 + 8 + 4 + 1 + 1 + 2 + 1 + 4;

const TAG_BOUNDARY: u8 = 0;
const TAG_STORED: u8 = 1;
const TAG_FIXED: u8 = 2;
const TAG_DYNAMIC: u8 = 3;

const WINDOW_RAW: u8 = 0;
const WINDOW_DEFLATE: u8 = 1;

/// Serialize `index` to `writer`.
pub fn save<W: Write>(index: &Index, mut writer: W) -> Result<()> {
    let buf = encode(index)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Parse and validate an index previously written by [`save`].
pub fn load<R: Read>(mut reader: R) -> Result<Index> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    decode(&buf)
}

/// Write `index` to `path` atomically: a failed save leaves any previous
/// file untouched and no partial file behind.
pub async fn save_to_path(index: &Index, path: &Path) -> Result<()> {
    let buf = encode(index)?;
    let tmp = temp_path(path);

    let written = async {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    tracing::debug!(path = %path.display(), bytes = buf.len(), "index saved");
    Ok(())
}

pub async fn load_from_path(path: &Path) -> Result<Index> {
    let buf = tokio::fs::read(path).await?;
    decode(&buf)
}

/// Load the index at `path` and confirm it still describes `source`.
///
/// Reads the whole source once. A changed source fails with
/// [`Error::IndexMismatch`] instead of handing back a stale index.
pub async fn load_for_source<R: ReadAt + ?Sized>(path: &Path, source: &R) -> Result<Index> {
    let index = load_from_path(path).await?;
    index.verify_source(source).await?;
    Ok(index)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn encode(index: &Index) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + index.checkpoints().len() * 64);
    buf.write_all(&INDEX_MAGIC)?;
    buf.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    buf.write_u64::<LittleEndian>(index.span_bytes())?;
    buf.write_u64::<LittleEndian>(index.source_byte_size())?;
    buf.write_u64::<LittleEndian>(index.uncompressed_byte_size())?;
    buf.write_u64::<LittleEndian>(index.source_checksum())?;
    buf.write_u64::<LittleEndian>(index.checkpoints().len() as u64)?;

    for cp in index.checkpoints() {
        write_checkpoint(&mut buf, cp)?;
    }

    let crc = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

fn write_checkpoint(buf: &mut Vec<u8>, cp: &Checkpoint) -> Result<()> {
    buf.write_u64::<LittleEndian>(cp.uncompressed_offset)?;
    buf.write_u64::<LittleEndian>(cp.compressed_bit_offset)?;
    buf.write_u32::<LittleEndian>(cp.member_id)?;

    match &cp.block {
        BlockState::Boundary => {
            buf.write_u8(TAG_BOUNDARY)?;
            buf.write_u8(0)?;
        }
        BlockState::Stored {
            remaining,
            is_final,
        } => {
            buf.write_u8(TAG_STORED)?;
            buf.write_u8(*is_final as u8)?;
            buf.write_u16::<LittleEndian>(*remaining)?;
        }
        BlockState::Fixed { is_final } => {
            buf.write_u8(TAG_FIXED)?;
            buf.write_u8(*is_final as u8)?;
        }
        BlockState::Dynamic {
            is_final,
            litlen_lengths,
            dist_lengths,
        } => {
            buf.write_u8(TAG_DYNAMIC)?;
            buf.write_u8(*is_final as u8)?;
            buf.write_u16::<LittleEndian>(litlen_lengths.len() as u16)?;
            buf.write_u8(dist_lengths.len() as u8)?;
            buf.write_all(litlen_lengths)?;
            buf.write_all(dist_lengths)?;
        }
    }

    // Windows of text compress well; keep whichever form is smaller.
    let compressed = if cp.window.is_empty() {
        None
    } else {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&cp.window)?;
        Some(enc.finish()?).filter(|c| c.len() < cp.window.len())
    };

    buf.write_u16::<LittleEndian>(cp.window.len() as u16)?;
    match compressed {
        Some(data) => {
            buf.write_u8(WINDOW_DEFLATE)?;
            buf.write_u32::<LittleEndian>(data.len() as u32)?;
            buf.write_all(&data)?;
        }
        None => {
            buf.write_u8(WINDOW_RAW)?;
            buf.write_u32::<LittleEndian>(cp.window.len() as u32)?;
            buf.write_all(&cp.window)?;
        }
    }
    Ok(())
}

fn decode(buf: &[u8]) -> Result<Index> {
    if buf.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::corrupt(format!("file too short ({} bytes)", buf.len())));
    }
    if buf[..4] != INDEX_MAGIC {
        return Err(Error::corrupt("bad magic"));
    }

    let (body, trailer) = buf.split_at(buf.len() - TRAILER_LEN);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(Error::corrupt(format!(
            "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
        )));
    }

    let mut cur = Cursor::new(&body[4..]);
    let version = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(format!("unsupported format version {version}")));
    }
    let span_bytes = cur.read_u64::<LittleEndian>().map_err(truncated)?;
    let source_byte_size = cur.read_u64::<LittleEndian>().map_err(truncated)?;
    let uncompressed_byte_size = cur.read_u64::<LittleEndian>().map_err(truncated)?;
    let source_checksum = cur.read_u64::<LittleEndian>().map_err(truncated)?;
    let count = cur.read_u64::<LittleEndian>().map_err(truncated)?;

    let room = (body.len() - HEADER_LEN) / MIN_CHECKPOINT_LEN;
    if count == 0 || count > room as u64 {
        return Err(Error::corrupt(format!("implausible checkpoint count {count}")));
    }

    let mut checkpoints = Vec::with_capacity(count as usize);
    for i in 0..count {
        let cp = read_checkpoint(&mut cur)
            .map_err(|e| Error::corrupt(format!("checkpoint {i}: {e}")))?;
        checkpoints.push(cp);
    }
    if cur.position() as usize != body.len() - 4 {
        return Err(Error::corrupt("trailing bytes after last checkpoint"));
    }

    Index::from_parts(
        source_byte_size,
        uncompressed_byte_size,
        span_bytes,
        source_checksum,
        checkpoints,
    )
    .map_err(Error::CorruptIndex)
}

fn truncated(_: std::io::Error) -> Error {
    Error::corrupt("unexpected end of data")
}

fn read_checkpoint(cur: &mut Cursor<&[u8]>) -> std::result::Result<Checkpoint, String> {
    let short = |_: std::io::Error| "unexpected end of data".to_string();

    let uncompressed_offset = cur.read_u64::<LittleEndian>().map_err(short)?;
    let compressed_bit_offset = cur.read_u64::<LittleEndian>().map_err(short)?;
    let member_id = cur.read_u32::<LittleEndian>().map_err(short)?;
    let tag = cur.read_u8().map_err(short)?;
    let is_final = match cur.read_u8().map_err(short)? {
        0 => false,
        1 => true,
        other => return Err(format!("bad final flag {other}")),
    };

    let block = match tag {
        TAG_BOUNDARY => BlockState::Boundary,
        TAG_STORED => BlockState::Stored {
            remaining: cur.read_u16::<LittleEndian>().map_err(short)?,
            is_final,
        },
        TAG_FIXED => BlockState::Fixed { is_final },
        TAG_DYNAMIC => {
            let nlen = cur.read_u16::<LittleEndian>().map_err(short)? as usize;
            let ndist = cur.read_u8().map_err(short)? as usize;
            if !(257..=286).contains(&nlen) || !(1..=30).contains(&ndist) {
                return Err(format!("bad code counts {nlen}/{ndist}"));
            }
            let mut litlen_lengths = vec![0u8; nlen];
            let mut dist_lengths = vec![0u8; ndist];
            cur.read_exact(&mut litlen_lengths).map_err(short)?;
            cur.read_exact(&mut dist_lengths).map_err(short)?;
            if litlen_lengths.iter().chain(&dist_lengths).any(|&l| l > 15) {
                return Err("code length above 15".into());
            }
            BlockState::Dynamic {
                is_final,
                litlen_lengths,
                dist_lengths,
            }
        }
        other => return Err(format!("unknown block tag {other}")),
    };

    let raw_len = cur.read_u16::<LittleEndian>().map_err(short)? as usize;
    let encoding = cur.read_u8().map_err(short)?;
    let encoded_len = cur.read_u32::<LittleEndian>().map_err(short)? as usize;
    if raw_len > WINDOW_SIZE {
        return Err(format!("window of {raw_len} bytes"));
    }
    let remaining = cur.get_ref().len() - cur.position() as usize;
    if encoded_len > remaining {
        return Err("window runs past the end of data".into());
    }
    let mut encoded = vec![0u8; encoded_len];
    cur.read_exact(&mut encoded).map_err(short)?;

    let window = match encoding {
        WINDOW_RAW if encoded_len == raw_len => encoded,
        WINDOW_RAW => return Err("raw window length disagrees".into()),
        WINDOW_DEFLATE => {
            let mut window = Vec::with_capacity(raw_len);
            DeflateDecoder::new(&encoded[..])
                .take(WINDOW_SIZE as u64 + 1)
                .read_to_end(&mut window)
                .map_err(|e| format!("window does not inflate: {e}"))?;
            if window.len() != raw_len {
                return Err(format!(
                    "window inflates to {} bytes, expected {}",
                    window.len(),
                    raw_len
                ));
            }
            window
        }
        other => return Err(format!("unknown window encoding {other}")),
    };

    Ok(Checkpoint {
        uncompressed_offset,
        compressed_bit_offset,
        window,
        member_id,
        block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        let window: Vec<u8> = b"the quick brown fox ".iter().copied().cycle().take(4000).collect();
        let noisy: Vec<u8> = (0..WINDOW_SIZE as u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let litlen = vec![8u8; 286];
        Index::from_parts(
            1_000_000,
            200_000,
            4000,
            0xCAFE_F00D,
            vec![
                Checkpoint {
                    uncompressed_offset: 0,
                    compressed_bit_offset: 80,
                    window: Vec::new(),
                    member_id: 0,
                    block: BlockState::Boundary,
                },
                Checkpoint {
                    uncompressed_offset: 4000,
                    compressed_bit_offset: 9000,
                    window,
                    member_id: 0,
                    block: BlockState::Stored {
                        remaining: 123,
                        is_final: false,
                    },
                },
                Checkpoint {
                    uncompressed_offset: 40_000,
                    compressed_bit_offset: 90_003,
                    window: noisy.clone(),
                    member_id: 0,
                    block: BlockState::Fixed { is_final: true },
                },
                Checkpoint {
                    uncompressed_offset: 80_000,
                    compressed_bit_offset: 300_001,
                    window: noisy,
                    member_id: 0,
                    block: BlockState::Dynamic {
                        is_final: false,
                        litlen_lengths: litlen,
                        dist_lengths: vec![5; 30],
                    },
                },
                Checkpoint {
                    uncompressed_offset: 120_000,
                    compressed_bit_offset: 500_000,
                    window: Vec::new(),
                    member_id: 1,
                    block: BlockState::Boundary,
                },
            ],
        )
        .unwrap()
    }

    fn saved() -> Vec<u8> {
        let mut buf = Vec::new();
        save(&sample_index(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn save_then_load_is_identity() {
        let buf = saved();
        assert_eq!(&buf[..4], b"GZRX");
        assert_eq!(load(&buf[..]).unwrap(), sample_index());
    }

    #[test]
    fn text_windows_are_compressed() {
        let buf = saved();
        // The 4000-byte repetitive window must not be stored raw.
        assert!(buf.len() < HEADER_LEN + 2 * WINDOW_SIZE + 4000);
    }

    #[test]
    fn every_truncation_is_rejected() {
        let buf = saved();
        for len in [0, 3, 10, HEADER_LEN, HEADER_LEN + 20, buf.len() / 2, buf.len() - 1] {
            assert!(
                matches!(load(&buf[..len]), Err(Error::CorruptIndex(_))),
                "truncated to {len}"
            );
        }
    }

    #[test]
    fn bit_flips_are_rejected() {
        let buf = saved();
        for pos in [0, 5, 20, HEADER_LEN + 3, buf.len() / 2, buf.len() - 2] {
            let mut bad = buf.clone();
            bad[pos] ^= 0x10;
            assert!(
                matches!(load(&bad[..]), Err(Error::CorruptIndex(_))),
                "flip at {pos}"
            );
        }
    }

    #[test]
    fn rejects_unknown_version_with_valid_crc() {
        let mut buf = saved();
        buf.truncate(buf.len() - TRAILER_LEN);
        buf[4] = 2;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            load(&buf[..]),
            Err(Error::CorruptIndex(msg)) if msg.contains("version")
        ));
    }

    #[test]
    fn rejects_invariant_violation_with_valid_crc() {
        let mut buf = saved();
        buf.truncate(buf.len() - TRAILER_LEN);
        // Uncompressed size below the last checkpoint offset.
        buf[24..32].copy_from_slice(&100u64.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(load(&buf[..]), Err(Error::CorruptIndex(_))));
    }

    #[tokio::test]
    async fn path_save_is_atomic_and_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.gz.gzrx");

        save_to_path(&sample_index(), &path).await.unwrap();
        assert_eq!(load_from_path(&path).await.unwrap(), sample_index());
        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(names.len(), 1);

        let missing = dir.path().join("nowhere").join("x.gzrx");
        assert!(save_to_path(&sample_index(), &missing).await.is_err());
        assert!(load_from_path(&missing).await.is_err());
    }
}
