//! Gzip member framing (RFC 1952).
//!
//! A gzip file is one or more members, each made of a header, a raw
//! deflate stream and an 8-byte trailer:
//!
//! ```text
//! +---+---+----+-----+-------+-----+----+   +=========+   +-------+-------+
//! |ID1|ID2| CM | FLG | MTIME | XFL | OS |...| deflate |...| CRC32 | ISIZE |
//! +---+---+----+-----+-------+-----+----+   +=========+   +-------+-------+
//! ```
//!
//! Optional fields follow the fixed header when the matching `FLG` bit is
//! set: `FEXTRA`, `FNAME`, `FCOMMENT` and `FHCRC`, in that order.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

use crate::error::{Error, Result};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const CM_DEFLATE: u8 = 8;

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xE0;

/// Parsed gzip member header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipHeader {
    pub text: bool,
    pub mtime: u32,
    pub extra_flags: u8,
    pub os: u8,
    pub extra: Option<Vec<u8>>,
    pub file_name: Option<String>,
    pub comment: Option<String>,
    /// Size of the header in bytes, including all optional fields.
    pub len: u64,
}

impl GzipHeader {
    /// Parse a member header from a byte-aligned reader.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut fixed = [0u8; 10];
        reader.read_exact(&mut fixed)?;

        if fixed[0..2] != GZIP_MAGIC {
            return Err(Error::malformed("not a gzip member (bad magic)"));
        }
        if fixed[2] != CM_DEFLATE {
            return Err(Error::malformed(format!(
                "unsupported compression method {}",
                fixed[2]
            )));
        }
        let flags = fixed[3];
        if flags & FRESERVED != 0 {
            return Err(Error::malformed("reserved gzip header flags set"));
        }

        let mut header = GzipHeader {
            text: flags & FTEXT != 0,
            mtime: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            extra_flags: fixed[8],
            os: fixed[9],
            len: 10,
            ..Default::default()
        };
        let mut crc = crc32fast::Hasher::new();
        crc.update(&fixed);

        if flags & FEXTRA != 0 {
            let xlen = reader.read_u16::<LittleEndian>()?;
            let mut extra = vec![0u8; xlen as usize];
            reader.read_exact(&mut extra)?;
            crc.update(&xlen.to_le_bytes());
            crc.update(&extra);
            header.len += 2 + xlen as u64;
            header.extra = Some(extra);
        }
        if flags & FNAME != 0 {
            let name = read_zero_terminated(reader)?;
            crc.update(&name);
            crc.update(&[0]);
            header.len += name.len() as u64 + 1;
            header.file_name = Some(String::from_utf8_lossy(&name).into_owned());
        }
        if flags & FCOMMENT != 0 {
            let comment = read_zero_terminated(reader)?;
            crc.update(&comment);
            crc.update(&[0]);
            header.len += comment.len() as u64 + 1;
            header.comment = Some(String::from_utf8_lossy(&comment).into_owned());
        }
        if flags & FHCRC != 0 {
            let stored = reader.read_u16::<LittleEndian>()?;
            let actual = (crc.finalize() & 0xFFFF) as u16;
            if stored != actual {
                return Err(Error::malformed("gzip header CRC mismatch"));
            }
            header.len += 2;
        }

        Ok(header)
    }
}

fn read_zero_terminated<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match reader.read_u8()? {
            0 => return Ok(out),
            b => out.push(b),
        }
    }
}

/// Gzip member trailer - 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GzipTrailer {
    pub crc32: u32,
    /// Uncompressed size modulo 2^32
    pub isize: u32,
}

impl GzipTrailer {
    pub const SIZE: usize = 8;

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            crc32: reader.read_u32::<LittleEndian>()?,
            isize: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Check the trailer against the decoded member.
    pub fn verify(&self, crc32: u32, len: u64) -> Result<()> {
        if self.crc32 != crc32 {
            return Err(Error::malformed(format!(
                "member CRC mismatch: trailer {:#010x}, data {:#010x}",
                self.crc32, crc32
            )));
        }
        if self.isize != len as u32 {
            return Err(Error::malformed(format!(
                "member size mismatch: trailer {}, data {}",
                self.isize, len as u32
            )));
        }
        Ok(())
    }
}
