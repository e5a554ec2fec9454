/// Maximum back-reference distance (32KB)
pub const WINDOW_SIZE: usize = 32 * 1024;

const MASK: usize = WINDOW_SIZE - 1;

/// Circular history of the most recent output bytes.
#[derive(Clone)]
pub struct Window {
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl Window {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Window pre-filled with `history`; only its last 32KB are kept.
    pub fn with_history(history: &[u8]) -> Self {
        let mut window = Self::new();
        window.extend(history);
        window
    }

    /// Number of valid history bytes (at most `WINDOW_SIZE`).
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos = (self.pos + 1) & MASK;
        if self.filled < WINDOW_SIZE {
            self.filled += 1;
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        let tail = if bytes.len() > WINDOW_SIZE {
            &bytes[bytes.len() - WINDOW_SIZE..]
        } else {
            bytes
        };
        for &b in tail {
            self.push(b);
        }
    }

    /// Byte `distance` positions back (1 = most recent). Caller checks range.
    #[inline]
    pub fn back(&self, distance: usize) -> u8 {
        debug_assert!(distance >= 1 && distance <= self.filled);
        self.buf[(self.pos + WINDOW_SIZE - distance) & MASK]
    }

    /// Valid history in output order, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let start = (self.pos + WINDOW_SIZE - self.filled) & MASK;
        let mut out = Vec::with_capacity(self.filled);
        if start + self.filled <= WINDOW_SIZE {
            out.extend_from_slice(&self.buf[start..start + self.filled]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..self.pos]);
        }
        out
    }

    pub fn clear(&mut self) {
        self.pos = 0;
        self.filled = 0;
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_before_wrap() {
        let mut w = Window::new();
        w.extend(b"hello");
        assert_eq!(w.len(), 5);
        assert_eq!(w.snapshot(), b"hello");
        assert_eq!(w.back(1), b'o');
        assert_eq!(w.back(5), b'h');
    }

    #[test]
    fn snapshot_after_wrap_keeps_last_32k() {
        let data: Vec<u8> = (0..WINDOW_SIZE + 1000).map(|i| (i % 251) as u8).collect();
        let mut w = Window::new();
        for chunk in data.chunks(777) {
            w.extend(chunk);
        }
        assert_eq!(w.len(), WINDOW_SIZE);
        assert_eq!(w.snapshot(), &data[data.len() - WINDOW_SIZE..]);

        let big = Window::with_history(&data);
        assert_eq!(big.snapshot(), &data[data.len() - WINDOW_SIZE..]);
    }
}
