//! Process-wide buffer pool
//!
//! Serves empty `BytesMut` buffers from power-of-two size classes between
//! 128 bytes and 16 MB. Each class keeps a bounded free list behind its own
//! lock so unrelated size classes never contend. Buffers whose capacity no
//! longer matches a class (for example after `split_to` trimmed a frame
//! header off the front) are dropped on return.

use std::sync::OnceLock;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Smallest pooled capacity
pub const MIN_CLASS: usize = 128;

/// Largest pooled capacity
pub const MAX_CLASS: usize = 16 * 1024 * 1024;

/// Retained buffers per size class
const MAX_CACHED: usize = 64;

const NUM_CLASSES: usize = (MAX_CLASS.ilog2() - MIN_CLASS.ilog2() + 1) as usize;

/// Pool of reusable byte buffers, one free list per power-of-two class.
pub struct BufferPool {
    classes: [Mutex<Vec<BytesMut>>; NUM_CLASSES],
}

impl BufferPool {
    /// Create an empty pool. Tests construct their own instance; runtime
    /// code normally goes through [`global`].
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Get an empty buffer with capacity at least `n`.
    ///
    /// Requests above the largest class are allocated exactly and will not
    /// be retained when returned.
    pub fn get(&self, n: usize) -> BytesMut {
        let Some(idx) = class_index(n) else {
            return BytesMut::with_capacity(n);
        };

        if let Some(mut buf) = self.classes[idx].lock().pop() {
            buf.clear();
            return buf;
        }
        BytesMut::with_capacity(class_size(idx))
    }

    /// Return a buffer to the pool. Only buffers whose capacity is exactly
    /// a class size are retained; anything else is dropped.
    pub fn put(&self, buf: BytesMut) {
        let cap = buf.capacity();
        if !cap.is_power_of_two() || !(MIN_CLASS..=MAX_CLASS).contains(&cap) {
            return;
        }
        let idx = (cap.ilog2() - MIN_CLASS.ilog2()) as usize;
        let mut class = self.classes[idx].lock();
        if class.len() < MAX_CACHED {
            class.push(buf);
        }
    }

    /// Number of buffers currently cached across all classes.
    pub fn cached(&self) -> usize {
        self.classes.iter().map(|c| c.lock().len()).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide pool used by connections and broadcasters.
pub fn global() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

#[inline]
fn class_index(n: usize) -> Option<usize> {
    if n > MAX_CLASS {
        return None;
    }
    let size = n.max(MIN_CLASS).next_power_of_two();
    Some((size.ilog2() - MIN_CLASS.ilog2()) as usize)
}

#[inline]
fn class_size(idx: usize) -> usize {
    MIN_CLASS << idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        assert_eq!(class_index(0), Some(0));
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(128), Some(0));
        assert_eq!(class_index(129), Some(1));
        assert_eq!(class_index(256), Some(1));
        assert_eq!(class_index(MAX_CLASS), Some(NUM_CLASSES - 1));
        assert_eq!(class_index(MAX_CLASS + 1), None);
    }

    #[test]
    fn test_get_capacity() {
        let pool = BufferPool::new();
        assert!(pool.get(1).capacity() >= 128);
        assert!(pool.get(129).capacity() >= 256);
        assert!(pool.get(70_000).capacity() >= 70_000);
    }

    #[test]
    fn test_put_get_reuses() {
        let pool = BufferPool::new();
        let buf = pool.get(1024);
        assert_eq!(buf.capacity(), 1024);

        pool.put(buf);
        assert_eq!(pool.cached(), 1);

        let again = pool.get(1000);
        assert_eq!(again.capacity(), 1024);
        assert_eq!(pool.cached(), 0);
        assert!(again.is_empty());
    }

    #[test]
    fn test_put_drops_non_class_capacity() {
        let pool = BufferPool::new();
        pool.put(BytesMut::with_capacity(1000));
        assert_eq!(pool.cached(), 0);

        pool.put(BytesMut::with_capacity(64));
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_oversized_request() {
        let pool = BufferPool::new();
        let big = pool.get(MAX_CLASS + 1);
        assert!(big.capacity() >= MAX_CLASS + 1);
        pool.put(big);
        // Oversized buffers are not retained
        assert_eq!(pool.cached(), 0);
    }
}
