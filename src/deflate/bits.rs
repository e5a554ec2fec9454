use std::io::{self, Read};

use crate::error::{Error, Result};

const INPUT_BUF_SIZE: usize = 32 * 1024;

/// LSB-first bit reader over a byte source, tracking its absolute position.
///
/// Bytes are pulled from `inner` only when bits are actually requested, so
/// a reader positioned at the end of a fetched range never reads past it
/// unless the decoder needs those bits.
pub struct BitReader<R> {
    inner: R,
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    eof: bool,
    /// Bit accumulator; the next bit is bit 0.
    hold: u64,
    bits: u32,
    /// Absolute offset of the next byte to be moved into `hold`.
    position: u64,
}

impl<R: Read> BitReader<R> {
    /// `offset` is the absolute byte offset of the first byte `inner` yields.
    pub fn new(inner: R, offset: u64) -> Self {
        Self {
            inner,
            buf: vec![0u8; INPUT_BUF_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
            eof: false,
            hold: 0,
            bits: 0,
            position: offset,
        }
    }

    /// Absolute bit offset of the next unread bit.
    #[inline]
    pub fn bit_position(&self) -> u64 {
        self.position * 8 - self.bits as u64
    }

    pub fn is_aligned(&self) -> bool {
        self.bits % 8 == 0
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        if self.head == self.tail {
            if self.eof {
                return Ok(None);
            }
            let n = loop {
                match self.inner.read(&mut self.buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.head = 0;
            self.tail = n;
        }
        let byte = self.buf[self.head];
        self.head += 1;
        self.position += 1;
        Ok(Some(byte))
    }

    /// Try to buffer at least `n` bits; returns how many are available,
    /// which is less than `n` only at end of input.
    #[inline]
    pub fn fill(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        while self.bits < n {
            match self.next_byte()? {
                Some(byte) => {
                    self.hold |= (byte as u64) << self.bits;
                    self.bits += 8;
                }
                None => break,
            }
        }
        Ok(self.bits)
    }

    /// Low `n` buffered bits without consuming them. Call `fill` first.
    #[inline]
    pub fn peek(&self, n: u32) -> u32 {
        (self.hold & ((1u64 << n) - 1)) as u32
    }

    #[inline]
    pub fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.bits);
        self.hold >>= n;
        self.bits -= n;
    }

    /// Read `n` bits (up to 32) as an LSB-first integer.
    #[inline]
    pub fn bits(&mut self, n: u32) -> Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        if self.fill(n)? < n {
            return Err(Error::TruncatedInput);
        }
        let value = self.peek(n);
        self.consume(n);
        Ok(value)
    }

    /// Discard bits up to the next byte boundary.
    pub fn align_to_byte(&mut self) {
        let partial = self.bits % 8;
        self.consume(partial);
    }

    /// Next whole byte; the reader must be byte aligned.
    #[inline]
    pub fn read_aligned_byte(&mut self) -> Result<Option<u8>> {
        debug_assert!(self.is_aligned());
        if self.bits >= 8 {
            let byte = self.hold as u8;
            self.consume(8);
            return Ok(Some(byte));
        }
        self.next_byte()
    }

    /// Next whole byte without consuming it.
    pub fn peek_byte(&mut self) -> Result<Option<u8>> {
        debug_assert!(self.is_aligned());
        if self.fill(8)? < 8 {
            return Ok(None);
        }
        Ok(Some(self.peek(8) as u8))
    }

    pub fn at_eof(&mut self) -> Result<bool> {
        Ok(self.peek_byte()?.is_none())
    }
}

/// Byte-aligned reads for gzip framing (headers and trailers).
impl<R: Read> Read for BitReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < out.len() {
            match self.read_aligned_byte().map_err(Error::into_io)? {
                Some(byte) => {
                    out[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}
