//! Fixed-capacity byte segments, the building block of pipes.

use std::fmt;

use super::object_pool::{ObjectPool, Poolable};

/// A fixed-capacity chunk of bytes. Written front to back, never grown.
pub struct Segment {
    data: Box<[u8]>,
    len: usize,
}

impl Segment {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left at the end of the segment.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copy as much of `src` as fits. Returns the number of bytes copied.
    pub fn extend_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }
}

impl Poolable for Segment {
    fn reset(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Shared pool of equally sized segments.
#[derive(Debug, Clone)]
pub struct SegmentPool {
    pool: ObjectPool<Segment>,
    segment_size: usize,
}

impl SegmentPool {
    /// # Panics
    /// Panics if `segment_size` or `capacity` is zero.
    pub fn new(segment_size: usize, capacity: usize) -> Self {
        assert!(segment_size > 0, "segment size must be greater than 0");
        Self {
            pool: ObjectPool::new("segments", capacity, move || {
                Segment::with_capacity(segment_size)
            }),
            segment_size,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// The underlying object pool.
    pub fn pool(&self) -> &ObjectPool<Segment> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_stops_at_capacity() {
        let mut segment = Segment::with_capacity(4);
        assert_eq!(segment.extend_from(b"abc"), 3);
        assert_eq!(segment.extend_from(b"def"), 1);
        assert!(segment.is_full());
        assert_eq!(segment.as_slice(), b"abcd");

        segment.reset();
        assert!(segment.is_empty());
        assert_eq!(segment.remaining(), 4);
    }

    #[test]
    fn pool_hands_out_configured_size() {
        let pool = SegmentPool::new(16, 2);
        let segment = pool.pool().rent();
        assert_eq!(segment.capacity(), 16);
        assert_eq!(pool.segment_size(), 16);
    }
}
