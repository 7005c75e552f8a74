//! Fixed-capacity circular byte buffer.
//!
//! Storage is `capacity + 1` bytes so that an empty buffer
//! (`read_pos == write_pos`) is distinguishable from a full one.
//! All operations are O(1) plus at most two `copy_from_slice` calls for
//! the wrap-around split. The ring never blocks and never reallocates;
//! short counts are the only signal. Synchronization is the caller's
//! responsibility.

/// Single-producer / single-consumer byte FIFO.
///
/// The contiguous-span and commit operations exist for zero-copy
/// integration with scatter-gather I/O: fill `contiguous_write_span`
/// directly from a syscall, then `commit_write` the byte count.
pub struct RingBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl RingBuffer {
    /// Create a ring able to hold `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buf: vec![0u8; capacity + 1].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Usable capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    /// Bytes available to read.
    #[inline]
    pub fn available_read(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buf.len() - self.read_pos + self.write_pos
        }
    }

    /// Bytes available to write.
    #[inline]
    pub fn available_write(&self) -> usize {
        self.capacity() - self.available_read()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        (self.write_pos + 1) % self.buf.len() == self.read_pos
    }

    /// Append up to `data.len()` bytes; returns the count actually written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available_write());
        if n == 0 {
            return 0;
        }

        let contiguous = self.contiguous_write_len();
        if n <= contiguous {
            self.buf[self.write_pos..self.write_pos + n].copy_from_slice(&data[..n]);
            self.write_pos = (self.write_pos + n) % self.buf.len();
        } else {
            let wp = self.write_pos;
            self.buf[wp..wp + contiguous].copy_from_slice(&data[..contiguous]);
            self.buf[..n - contiguous].copy_from_slice(&data[contiguous..n]);
            self.write_pos = n - contiguous;
        }
        n
    }

    /// Copy up to `out.len()` bytes into `out` and consume them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        if n > 0 {
            self.read_pos = (self.read_pos + n) % self.buf.len();
        }
        n
    }

    /// Copy up to `out.len()` bytes into `out` without consuming.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.available_read());
        if n == 0 {
            return 0;
        }

        let contiguous = self.contiguous_read_len();
        if n <= contiguous {
            out[..n].copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
        } else {
            out[..contiguous].copy_from_slice(&self.buf[self.read_pos..self.read_pos + contiguous]);
            out[contiguous..n].copy_from_slice(&self.buf[..n - contiguous]);
        }
        n
    }

    /// Drop up to `n` read-side bytes; returns the count actually skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.available_read());
        if n > 0 {
            self.read_pos = (self.read_pos + n) % self.buf.len();
        }
        n
    }

    /// Reset to empty without touching the storage.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn contiguous_write_len(&self) -> usize {
        if self.write_pos >= self.read_pos {
            let to_end = self.buf.len() - self.write_pos;
            // read_pos == 0 means the slot before it is the full marker
            if self.read_pos == 0 {
                to_end - 1
            } else {
                to_end
            }
        } else {
            self.read_pos - self.write_pos - 1
        }
    }

    fn contiguous_read_len(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buf.len() - self.read_pos
        }
    }

    /// Largest slice that can be filled in place at the write position.
    ///
    /// Pair with [`commit_write`](Self::commit_write) after the fill.
    pub fn contiguous_write_span(&mut self) -> &mut [u8] {
        let n = self.contiguous_write_len();
        let wp = self.write_pos;
        &mut self.buf[wp..wp + n]
    }

    /// Largest readable slice at the read position.
    ///
    /// Pair with [`commit_read`](Self::commit_read) once consumed.
    pub fn contiguous_read_span(&self) -> &[u8] {
        let n = self.contiguous_read_len();
        &self.buf[self.read_pos..self.read_pos + n]
    }

    /// Advance the write position after an in-place fill. Saturates at
    /// the available write space; returns the count actually committed.
    pub fn commit_write(&mut self, n: usize) -> usize {
        let n = n.min(self.available_write());
        self.write_pos = (self.write_pos + n) % self.buf.len();
        n
    }

    /// Advance the read position after an in-place consume. Saturates at
    /// the available read count; returns the count actually committed.
    pub fn commit_read(&mut self, n: usize) -> usize {
        let n = n.min(self.available_read());
        self.read_pos = (self.read_pos + n) % self.buf.len();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_full() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        assert_eq!(rb.available_write(), 4);

        assert_eq!(rb.write(b"abcd"), 4);
        assert!(rb.is_full());
        assert_eq!(rb.available_read(), 4);
        assert_eq!(rb.available_write(), 0);
        assert_eq!(rb.write(b"x"), 0);
    }

    #[test]
    fn test_read_returns_written_bytes() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"hello");
        let mut out = [0u8; 16];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut rb = RingBuffer::new(8);
        let mut out = [0u8; 8];

        // Push the positions near the end of storage, then wrap.
        rb.write(b"012345");
        assert_eq!(rb.read(&mut out[..4]), 4);
        rb.write(b"6789ab");
        assert_eq!(rb.available_read(), 8);
        assert!(rb.is_full());

        let mut all = [0u8; 8];
        assert_eq!(rb.read(&mut all), 8);
        assert_eq!(&all, b"456789ab");
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abc");
        let mut out = [0u8; 8];
        assert_eq!(rb.peek(&mut out[..2]), 2);
        assert_eq!(&out[..2], b"ab");
        assert_eq!(rb.available_read(), 3);
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn test_skip_saturates() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        assert_eq!(rb.skip(4), 4);
        assert_eq!(rb.skip(100), 2);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_commit_spans_roundtrip() {
        let mut rb = RingBuffer::new(8);
        let span = rb.contiguous_write_span();
        let n = span.len().min(5);
        span[..n].copy_from_slice(&b"01234"[..n]);
        assert_eq!(rb.commit_write(n), n);
        assert_eq!(rb.available_read(), n);

        let got = rb.contiguous_read_span().to_vec();
        assert_eq!(&got[..], &b"01234"[..n]);
        assert_eq!(rb.commit_read(n), n);
        assert!(rb.is_empty());
    }

    // Read bytes are always a prefix of written bytes, and
    // available_read + available_write == capacity at every step.
    #[test]
    fn test_conservation_over_mixed_sequence() {
        let mut rb = RingBuffer::new(31);
        let mut written: Vec<u8> = Vec::new();
        let mut consumed: Vec<u8> = Vec::new();
        let mut seed: u32 = 0x12345678;

        for step in 0..2000 {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            let n = (seed % 13) as usize;
            if step % 2 == 0 {
                let chunk: Vec<u8> = (0..n).map(|i| (written.len() + i) as u8).collect();
                let w = rb.write(&chunk);
                written.extend_from_slice(&chunk[..w]);
            } else {
                let mut out = vec![0u8; n];
                let r = rb.read(&mut out);
                consumed.extend_from_slice(&out[..r]);
            }
            assert_eq!(rb.available_read() + rb.available_write(), rb.capacity());
        }

        let mut rest = vec![0u8; rb.available_read()];
        let r = rb.read(&mut rest);
        consumed.extend_from_slice(&rest[..r]);
        assert_eq!(consumed, written);
    }
}
