//! TCP send/receive ring buffer.
//!
//! `in_pos` is the producer offset, `out_pos` the consumer offset; since
//! both wrap to the same value when the ring is either empty or full,
//! `count` is what disambiguates the two, exactly as the original's
//! `tcp_buf_t` comment describes.

pub struct RingBuf {
    data: Vec<u8>,
    size: usize,
    in_pos: usize,
    out_pos: usize,
    count: usize,
}

impl RingBuf {
    pub fn new(size: usize) -> RingBuf {
        RingBuf { data: vec![0u8; size], size, in_pos: 0, out_pos: 0, count: 0 }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn free_cnt(&self) -> usize {
        self.size - self.count
    }

    /// Appends as many bytes of `data` as fit; returns the number written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_cnt());
        for &b in &data[..n] {
            self.data[self.in_pos] = b;
            self.in_pos = (self.in_pos + 1) % self.size;
        }
        self.count += n;
        n
    }

    /// Copies out (without removing) up to `len` bytes starting `offset`
    /// bytes into the buffer from its current read position — used both by
    /// the application `recv` path (which then calls `remove`) and by
    /// retransmission, which re-reads from `snd.una` without consuming.
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        let avail = self.count.saturating_sub(offset);
        let n = len.min(avail);
        let mut out = Vec::with_capacity(n);
        let mut pos = (self.out_pos + offset) % self.size;
        for _ in 0..n {
            out.push(self.data[pos]);
            pos = (pos + 1) % self.size;
        }
        out
    }

    /// Drops the first `n` bytes (they've been acked or read).
    pub fn remove(&mut self, n: usize) {
        let n = n.min(self.count);
        self.out_pos = (self.out_pos + n) % self.size;
        self.count -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_peek_then_remove() {
        let mut buf = RingBuf::new(8);
        assert_eq!(buf.write(b"abcd"), 4);
        assert_eq!(buf.peek(0, 4), b"abcd");
        buf.remove(2);
        assert_eq!(buf.peek(0, 2), b"cd");
        assert_eq!(buf.count(), 2);
    }

    #[test]
    fn write_caps_at_free_space() {
        let mut buf = RingBuf::new(4);
        assert_eq!(buf.write(b"abcdef"), 4);
        assert_eq!(buf.free_cnt(), 0);
    }

    #[test]
    fn wraps_around_after_remove() {
        let mut buf = RingBuf::new(4);
        buf.write(b"ab");
        buf.remove(2);
        buf.write(b"cdef");
        assert_eq!(buf.peek(0, 4), b"cdef");
    }
}
