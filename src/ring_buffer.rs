//! Fixed-capacity single-producer/single-consumer byte buffer.
//!
//! Two cursors `r <= w <= cap`. `r` and `w` only ever advance; callers must
//! `reset` once `w` reaches `cap` and the buffer has been fully drained.
//! There is no wraparound — this mirrors the original C ring buffer's
//! `read_ptr`/`write_ptr`/`adv` discipline exactly, rather than a classic
//! circular buffer.

#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    r: usize,
    w: usize,
}

impl RingBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        RingBuffer {
            data: vec![0u8; cap],
            r: 0,
            w: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to read.
    pub fn len(&self) -> usize {
        self.w - self.r
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    pub fn can_read(&self) -> bool {
        self.r < self.w
    }

    pub fn can_write(&self) -> bool {
        self.w < self.data.len()
    }

    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
    }

    /// `(pointer, length)` of the unread region.
    pub fn read_ptr(&self) -> &[u8] {
        &self.data[self.r..self.w]
    }

    /// `(pointer, length)` of the unwritten region.
    pub fn write_ptr(&mut self) -> &mut [u8] {
        let w = self.w;
        &mut self.data[w..]
    }

    /// Advance the read cursor by `k` bytes. `k` must be `<= len()`.
    pub fn read_adv(&mut self, k: usize) {
        debug_assert!(self.r + k <= self.w, "read_adv past write cursor");
        self.r = (self.r + k).min(self.w);
    }

    /// Advance the write cursor by `k` bytes. `k` must be `<= capacity() - w`.
    pub fn write_adv(&mut self, k: usize) {
        debug_assert!(self.w + k <= self.data.len(), "write_adv past capacity");
        self.w = (self.w + k).min(self.data.len());
    }

    pub fn read_one(&mut self) -> Option<u8> {
        if self.can_read() {
            let b = self.data[self.r];
            self.r += 1;
            Some(b)
        } else {
            None
        }
    }

    pub fn write_one(&mut self, byte: u8) -> bool {
        if self.can_write() {
            self.data[self.w] = byte;
            self.w += 1;
            true
        } else {
            false
        }
    }

    /// Drop `k` already-read bytes from the front by compacting the buffer,
    /// so long-lived connections whose read side periodically drains don't
    /// have to wait for `reset` (which is only safe once the buffer is fully
    /// drained). Used by the tunnel states, whose buffer never hits a clean
    /// "fully drained" boundary between client and target traffic.
    pub fn compact(&mut self) {
        if self.r == 0 {
            return;
        }
        self.data.copy_within(self.r..self.w, 0);
        self.w -= self.r;
        self.r = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_full_capacity_writable() {
        let rb = RingBuffer::with_capacity(16);
        assert_eq!(rb.len(), 0);
        assert!(!rb.can_read());
        assert!(rb.can_write());
        assert_eq!(rb.capacity(), 16);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut rb = RingBuffer::with_capacity(8);
        {
            let w = rb.write_ptr();
            w[..5].copy_from_slice(b"hello");
        }
        rb.write_adv(5);
        assert_eq!(rb.read_ptr(), b"hello");
        rb.read_adv(5);
        assert!(!rb.can_read());
    }

    #[test]
    fn no_wraparound_requires_reset() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write_ptr()[..4].copy_from_slice(b"abcd");
        rb.write_adv(4);
        assert!(!rb.can_write());
        rb.read_adv(4);
        assert!(!rb.can_write(), "w stays at capacity until reset");
        rb.reset();
        assert!(rb.can_write());
        assert_eq!(rb.write_ptr().len(), 4);
    }

    #[test]
    fn compact_preserves_unread_bytes() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write_ptr()[..6].copy_from_slice(b"abcdef");
        rb.write_adv(6);
        rb.read_adv(4);
        rb.compact();
        assert_eq!(rb.read_ptr(), b"ef");
        assert_eq!(rb.write_ptr().len(), 6);
    }
}
