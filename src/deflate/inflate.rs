use std::io::{self, Read};

use super::bits::BitReader;
use super::huffman::Huffman;
use super::window::Window;
use crate::error::{Error, Result};
use crate::index::Checkpoint;

/// End of block symbol
const END_OF_BLOCK: u16 = 256;

/// Extra bits for length codes
static LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

/// Base lengths for length codes
static LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

/// Extra bits for distance codes
static DISTANCE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Base distances for distance codes
static DISTANCE_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

/// Code length alphabet order for dynamic Huffman
static CODELEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Deflate block state at a symbol boundary.
///
/// Together with the bit offset and the window this is everything needed to
/// continue decoding, including from the middle of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    /// The next bits are a block header.
    Boundary,
    /// Inside a stored block with `remaining` literal bytes left.
    Stored { remaining: u16, is_final: bool },
    /// Inside a block using the fixed Huffman codes.
    Fixed { is_final: bool },
    /// Inside a block with its own Huffman codes.
    Dynamic {
        is_final: bool,
        litlen_lengths: Vec<u8>,
        dist_lengths: Vec<u8>,
    },
}

impl BlockState {
    pub fn is_final(&self) -> bool {
        match self {
            BlockState::Boundary => false,
            BlockState::Stored { is_final, .. }
            | BlockState::Fixed { is_final }
            | BlockState::Dynamic { is_final, .. } => *is_final,
        }
    }
}

struct Codes {
    dynamic: bool,
    litlen: Huffman,
    dist: Huffman,
    litlen_lengths: Vec<u8>,
    dist_lengths: Vec<u8>,
}

impl Codes {
    fn fixed() -> Result<Self> {
        let mut litlen = vec![8u8; 288];
        litlen[144..256].fill(9);
        litlen[256..280].fill(7);
        // Distance codes 30 and 31 are rejected at decode time.
        let dist = vec![5u8; 32];
        Ok(Self {
            dynamic: false,
            litlen: Huffman::new(&litlen)?,
            dist: Huffman::new(&dist)?,
            litlen_lengths: Vec::new(),
            dist_lengths: Vec::new(),
        })
    }

    fn dynamic(litlen_lengths: Vec<u8>, dist_lengths: Vec<u8>) -> Result<Self> {
        if litlen_lengths.len() < 257 || litlen_lengths.len() > 286 || dist_lengths.len() > 30 {
            return Err(Error::malformed("too many length or distance codes"));
        }
        if litlen_lengths[END_OF_BLOCK as usize] == 0 {
            return Err(Error::malformed("missing end-of-block code"));
        }
        Ok(Self {
            dynamic: true,
            litlen: Huffman::new(&litlen_lengths)?,
            dist: Huffman::new(&dist_lengths)?,
            litlen_lengths,
            dist_lengths,
        })
    }
}

enum Block {
    Header,
    Stored { remaining: u16 },
    Huffman(Box<Codes>),
    Done,
}

struct Match {
    length: usize,
    distance: usize,
}

enum Step {
    Continue,
    Header,
    EndBlock,
}

/// Deflate decoder producing output on demand.
///
/// Output is a forward-only sequence: each call to [`next_bytes`](Self::next_bytes)
/// continues where the previous one stopped. Re-reading earlier data needs a
/// new instance, either from the member start or from a [`Checkpoint`].
pub struct Inflater<R> {
    input: BitReader<R>,
    history: Window,
    block: Block,
    is_final: bool,
    pending: Option<Match>,
    out: Vec<u8>,
    total_out: u64,
}

impl<R: Read> Inflater<R> {
    /// Decoder positioned at the first deflate bit of a member.
    pub fn new(input: BitReader<R>) -> Self {
        Self {
            input,
            history: Window::new(),
            block: Block::Header,
            is_final: false,
            pending: None,
            out: Vec::new(),
            total_out: 0,
        }
    }

    /// Decoder resumed at `checkpoint`.
    ///
    /// `input` must yield the compressed bytes starting at byte
    /// `checkpoint.compressed_bit_offset / 8`.
    pub fn resume(input: R, checkpoint: &Checkpoint) -> Result<Self> {
        let byte = checkpoint.compressed_bit_offset / 8;
        let skip = (checkpoint.compressed_bit_offset % 8) as u32;
        let mut reader = BitReader::new(input, byte);
        reader.bits(skip)?;

        let (block, is_final) = match &checkpoint.block {
            BlockState::Boundary => (Block::Header, false),
            BlockState::Stored {
                remaining,
                is_final,
            } => {
                if skip != 0 {
                    return Err(Error::corrupt("stored-block checkpoint is not byte aligned"));
                }
                (
                    Block::Stored {
                        remaining: *remaining,
                    },
                    *is_final,
                )
            }
            BlockState::Fixed { is_final } => (Block::Huffman(Box::new(Codes::fixed()?)), *is_final),
            BlockState::Dynamic {
                is_final,
                litlen_lengths,
                dist_lengths,
            } => {
                let codes = Codes::dynamic(litlen_lengths.clone(), dist_lengths.clone())
                    .map_err(|e| Error::corrupt(format!("checkpoint Huffman codes: {e}")))?;
                (Block::Huffman(Box::new(codes)), *is_final)
            }
        };

        Ok(Self {
            input: reader,
            history: Window::with_history(&checkpoint.window),
            block,
            is_final,
            pending: None,
            out: Vec::new(),
            total_out: 0,
        })
    }

    /// Absolute bit offset of the next unread compressed bit.
    pub fn bit_position(&self) -> u64 {
        self.input.bit_position()
    }

    /// Bytes produced by this instance so far.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    /// Whether the final block has ended.
    pub fn is_done(&self) -> bool {
        matches!(self.block, Block::Done)
    }

    /// Bytes still owed by a back-reference that was cut short.
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |m| m.length)
    }

    /// Current block state, if decoding sits between two symbols.
    pub fn resume_state(&self) -> Option<BlockState> {
        if self.pending.is_some() {
            return None;
        }
        let is_final = self.is_final;
        match &self.block {
            Block::Done => None,
            Block::Header => Some(BlockState::Boundary),
            Block::Stored { remaining } => Some(BlockState::Stored {
                remaining: *remaining,
                is_final,
            }),
            Block::Huffman(codes) if !codes.dynamic => Some(BlockState::Fixed { is_final }),
            Block::Huffman(codes) => Some(BlockState::Dynamic {
                is_final,
                litlen_lengths: codes.litlen_lengths.clone(),
                dist_lengths: codes.dist_lengths.clone(),
            }),
        }
    }

    /// Decode up to `max` bytes. An empty slice means the final block ended.
    pub fn next_bytes(&mut self, max: usize) -> Result<&[u8]> {
        self.out.clear();

        while self.out.len() < max {
            if let Some(m) = self.pending.as_mut() {
                let n = m.length.min(max - self.out.len());
                for _ in 0..n {
                    let byte = self.history.back(m.distance);
                    self.history.push(byte);
                    self.out.push(byte);
                }
                m.length -= n;
                if m.length == 0 {
                    self.pending = None;
                }
                continue;
            }

            let step = match &mut self.block {
                Block::Done => break,
                Block::Header => Step::Header,
                Block::Stored { remaining } => {
                    if *remaining == 0 {
                        Step::EndBlock
                    } else {
                        let n = (*remaining as usize).min(max - self.out.len());
                        for _ in 0..n {
                            let byte = self
                                .input
                                .read_aligned_byte()?
                                .ok_or(Error::TruncatedInput)?;
                            self.history.push(byte);
                            self.out.push(byte);
                        }
                        *remaining -= n as u16;
                        Step::Continue
                    }
                }
                Block::Huffman(codes) => {
                    let symbol = codes.litlen.decode(&mut self.input)?;
                    match symbol {
                        0..=255 => {
                            self.history.push(symbol as u8);
                            self.out.push(symbol as u8);
                            Step::Continue
                        }
                        END_OF_BLOCK => Step::EndBlock,
                        257..=285 => {
                            let idx = (symbol - 257) as usize;
                            let length = LENGTH_BASE[idx] as usize
                                + self.input.bits(LENGTH_EXTRA_BITS[idx] as u32)? as usize;

                            let dsym = codes.dist.decode(&mut self.input)? as usize;
                            if dsym >= DISTANCE_BASE.len() {
                                return Err(Error::malformed("invalid distance symbol"));
                            }
                            let distance = DISTANCE_BASE[dsym] as usize
                                + self.input.bits(DISTANCE_EXTRA_BITS[dsym] as u32)? as usize;
                            if distance > self.history.len() {
                                return Err(Error::malformed(format!(
                                    "distance {} too far back ({} bytes of history)",
                                    distance,
                                    self.history.len()
                                )));
                            }

                            self.pending = Some(Match { length, distance });
                            Step::Continue
                        }
                        _ => return Err(Error::malformed("invalid literal/length symbol")),
                    }
                }
            };

            match step {
                Step::Continue => {}
                Step::Header => self.read_block_header()?,
                Step::EndBlock => {
                    self.block = if self.is_final {
                        Block::Done
                    } else {
                        Block::Header
                    };
                }
            }
        }

        self.total_out += self.out.len() as u64;
        Ok(&self.out)
    }

    /// Hand back the input, byte aligned, once the final block has ended.
    pub fn finish(mut self) -> Result<BitReader<R>> {
        if !self.is_done() {
            return Err(Error::malformed("deflate stream did not reach its final block"));
        }
        self.input.align_to_byte();
        Ok(self.input)
    }

    fn read_block_header(&mut self) -> Result<()> {
        self.is_final = self.input.bits(1)? == 1;
        let kind = self.input.bits(2)?;

        self.block = match kind {
            0 => {
                self.input.align_to_byte();
                let len = self.input.bits(16)?;
                let nlen = self.input.bits(16)?;
                if len != !nlen & 0xFFFF {
                    return Err(Error::malformed("stored block length mismatch"));
                }
                Block::Stored {
                    remaining: len as u16,
                }
            }
            1 => Block::Huffman(Box::new(Codes::fixed()?)),
            2 => Block::Huffman(Box::new(self.read_dynamic_codes()?)),
            _ => return Err(Error::malformed("invalid block type")),
        };
        Ok(())
    }

    fn read_dynamic_codes(&mut self) -> Result<Codes> {
        let nlen = self.input.bits(5)? as usize + 257;
        let ndist = self.input.bits(5)? as usize + 1;
        let ncode = self.input.bits(4)? as usize + 4;
        if nlen > 286 || ndist > 30 {
            return Err(Error::malformed("too many length or distance codes"));
        }

        let mut code_lengths = [0u8; 19];
        for &slot in CODELEN_ORDER.iter().take(ncode) {
            code_lengths[slot] = self.input.bits(3)? as u8;
        }
        let lencode = Huffman::new(&code_lengths)?;
        if !lencode.is_complete() {
            return Err(Error::malformed("incomplete code length code"));
        }

        let total = nlen + ndist;
        let mut lengths = vec![0u8; total];
        let mut index = 0;
        while index < total {
            let symbol = lencode.decode(&mut self.input)?;
            if symbol < 16 {
                lengths[index] = symbol as u8;
                index += 1;
                continue;
            }

            let (value, repeat) = match symbol {
                16 => {
                    if index == 0 {
                        return Err(Error::malformed("repeat with no previous length"));
                    }
                    (lengths[index - 1], 3 + self.input.bits(2)? as usize)
                }
                17 => (0, 3 + self.input.bits(3)? as usize),
                _ => (0, 11 + self.input.bits(7)? as usize),
            };
            if index + repeat > total {
                return Err(Error::malformed("too many code lengths"));
            }
            lengths[index..index + repeat].fill(value);
            index += repeat;
        }

        let dist_lengths = lengths.split_off(nlen);
        Codes::dynamic(lengths, dist_lengths)
    }
}

impl<R: Read> Read for Inflater<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.next_bytes(buf.len()).map_err(Error::into_io)?;
        let n = chunk.len();
        buf[..n].copy_from_slice(chunk);
        Ok(n)
    }
}
