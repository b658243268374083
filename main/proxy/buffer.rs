//! Fixed-capacity byte ring for one endpoint direction.
//!
//! Bytes received from a socket land at the fill position; bytes sent to
//! the peer socket drain from the drain position. Both sides see a
//! contiguous slice, so wrap-around is handled by clamping each region to
//! the end of the backing storage; the splice loop naturally picks up the
//! wrapped remainder on its next pass. When the buffer empties the
//! positions reset to zero, keeping regions maximally contiguous.

use std::cmp::min;

use static_assertions::const_assert;

/// Per-direction buffer capacity.
pub const PROXY_BUF_SIZE: usize = 32 * 1024;

const_assert!(PROXY_BUF_SIZE > 0);

pub struct RingBuf {
    data: Box<[u8]>,
    /// Offset of the next byte to drain toward the peer socket.
    head: usize,
    len: usize,
}

impl RingBuf {
    pub fn new(capacity: usize) -> RingBuf {
        assert!(capacity > 0);
        RingBuf {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % self.capacity()
    }

    /// Contiguous region a socket read can fill. Empty iff the buffer is
    /// full.
    pub fn fill_slice(&mut self) -> &mut [u8] {
        let tail = self.tail();
        let n = min(self.capacity() - self.len, self.capacity() - tail);
        &mut self.data[tail..tail + n]
    }

    /// Account for `n` bytes written into [`Self::fill_slice`].
    pub fn advance_fill(&mut self, n: usize) {
        let tail = self.tail();
        let contiguous = min(self.capacity() - self.len, self.capacity() - tail);
        assert!(n <= contiguous, "fill advance past region boundary");
        self.len += n;
    }

    /// Contiguous region of buffered bytes awaiting transmission. Empty
    /// iff the buffer is empty.
    pub fn drain_slice(&self) -> &[u8] {
        let n = min(self.len, self.capacity() - self.head);
        &self.data[self.head..self.head + n]
    }

    /// Account for `n` bytes consumed from [`Self::drain_slice`].
    pub fn advance_drain(&mut self, n: usize) {
        let contiguous = min(self.len, self.capacity() - self.head);
        assert!(n <= contiguous, "drain advance past region boundary");
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
    }
}
