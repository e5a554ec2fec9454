use std::io::Read;

use super::bits::BitReader;
use crate::error::{Error, Result};

const MAX_BITS: usize = 15;
const FAST_BITS: u32 = 9;

/// Canonical Huffman decoder.
///
/// Codes up to `FAST_BITS` long resolve through a direct lookup table; longer
/// codes, and any code near the end of input, fall back to canonical
/// decoding one bit at a time.
pub struct Huffman {
    /// Number of codes of each length (index 0 unused).
    counts: [u16; MAX_BITS + 1],
    /// Symbols ordered by code length, then symbol value.
    symbols: Vec<u16>,
    /// `symbol << 4 | length` indexed by the next `FAST_BITS` input bits; 0 = miss.
    fast: Vec<u16>,
    complete: bool,
}

impl Huffman {
    /// Build a decoder from per-symbol code lengths (0 = unused symbol).
    ///
    /// Over-subscribed codes are rejected. Incomplete codes are accepted only
    /// when they consist of a single one-bit code, or of no codes at all; the
    /// unused bit patterns then fail at decode time.
    pub fn new(lengths: &[u8]) -> Result<Self> {
        let mut counts = [0u16; MAX_BITS + 1];
        for &len in lengths {
            if len as usize > MAX_BITS {
                return Err(Error::malformed("code length exceeds 15"));
            }
            counts[len as usize] += 1;
        }

        let used = lengths.len() - counts[0] as usize;
        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= counts[len] as i32;
            if left < 0 {
                return Err(Error::malformed("over-subscribed Huffman code"));
            }
        }
        if left > 0 && used > 1 {
            return Err(Error::malformed("incomplete Huffman code"));
        }
        if left > 0 && used == 1 && counts[1] != 1 {
            return Err(Error::malformed("incomplete Huffman code"));
        }

        let mut offsets = [0u16; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + counts[len];
        }
        let mut symbols = vec![0u16; used];
        for (symbol, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbols[offsets[len as usize] as usize] = symbol as u16;
                offsets[len as usize] += 1;
            }
        }

        let mut fast = vec![0u16; 1 << FAST_BITS];
        let mut code: u32 = 0;
        let mut index = 0usize;
        for len in 1..=MAX_BITS as u32 {
            for _ in 0..counts[len as usize] {
                if len <= FAST_BITS {
                    let symbol = symbols[index];
                    let reversed = reverse_bits(code, len);
                    let mut slot = reversed as usize;
                    while slot < fast.len() {
                        fast[slot] = (symbol << 4) | len as u16;
                        slot += 1 << len;
                    }
                }
                code += 1;
                index += 1;
            }
            code <<= 1;
        }

        Ok(Self {
            counts,
            symbols,
            fast,
            complete: left == 0,
        })
    }

    /// Whether every bit pattern decodes to a symbol.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn decode<R: Read>(&self, input: &mut BitReader<R>) -> Result<u16> {
        if input.fill(FAST_BITS)? >= FAST_BITS {
            let entry = self.fast[input.peek(FAST_BITS) as usize];
            if entry != 0 {
                input.consume((entry & 0xF) as u32);
                return Ok(entry >> 4);
            }
        }
        self.decode_slow(input)
    }

    fn decode_slow<R: Read>(&self, input: &mut BitReader<R>) -> Result<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            code |= input.bits(1)? as i32;
            let count = self.counts[len] as i32;
            if code - first < count {
                return Ok(self.symbols[(index + code - first) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }
        Err(Error::malformed("invalid Huffman code"))
    }
}

fn reverse_bits(value: u32, len: u32) -> u32 {
    value.reverse_bits() >> (32 - len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_canonical_codes() {
        // Lengths (2, 1, 3, 3): B=0, A=10, C=110, D=111 (MSB-first).
        let table = Huffman::new(&[2, 1, 3, 3]).unwrap();
        // Stream "B A C D" packed LSB-first, codes bit-reversed on the wire:
        // B: 0 | A: 1,0 | C: 1,1,0 | D: 1,1,1
        let bits = [0u8, 1, 0, 1, 1, 0, 1, 1, 1];
        let mut byte = [0u8; 2];
        for (i, b) in bits.iter().enumerate() {
            byte[i / 8] |= b << (i % 8);
        }
        let mut r = BitReader::new(&byte[..], 0);
        let decoded: Vec<u16> = (0..4).map(|_| table.decode(&mut r).unwrap()).collect();
        assert_eq!(decoded, [1, 0, 2, 3]);
    }

    #[test]
    fn rejects_oversubscribed() {
        assert!(matches!(
            Huffman::new(&[1, 1, 1]),
            Err(Error::MalformedStream(_))
        ));
    }

    #[test]
    fn rejects_incomplete_multi_code() {
        assert!(Huffman::new(&[2, 2, 2]).is_err());
    }

    #[test]
    fn single_code_is_allowed_but_unused_pattern_fails() {
        let table = Huffman::new(&[0, 1]).unwrap();
        let data = [0b10u8];
        let mut r = BitReader::new(&data[..], 0);
        assert_eq!(table.decode(&mut r).unwrap(), 1);
        assert!(table.decode(&mut r).is_err());
    }

    #[test]
    fn long_codes_use_slow_path() {
        let mut lengths = vec![0u8; 20];
        // 1, 2, ..., 14, 15, 15: a complete code with maximal depth.
        for (i, len) in lengths.iter_mut().enumerate().take(15) {
            *len = (i + 1) as u8;
        }
        lengths[15] = 15;
        let table = Huffman::new(&lengths).unwrap();
        // Symbol 15 is fourteen 1 bits followed by a final 1 (code 111...1).
        let data = [0xFFu8, 0x7F, 0x00];
        let mut r = BitReader::new(&data[..], 0);
        assert_eq!(table.decode(&mut r).unwrap(), 15);
        assert_eq!(r.bit_position(), 15);
    }
}
