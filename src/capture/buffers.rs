//! Lock-free pool of frame buffers reused by the capture pipeline

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

/// Fixed set of pre-allocated buffers. Frames borrow one while they are alive;
/// when the pool runs dry the capture loop drops frames instead of allocating.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicUsize,
    recycled: AtomicUsize,
    exhausted: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_capacity: usize) -> Arc<Self> {
        let count = count.max(1);
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            // Cannot fail: the queue was sized for exactly `count` buffers
            let _ = free.push(Vec::with_capacity(buffer_capacity));
        }
        Arc::new(Self {
            free,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Borrow a buffer, or `None` when every buffer is held by a live frame
    pub fn acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        match self.free.pop() {
            Some(mut data) => {
                data.clear();
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                Some(PooledBuffer {
                    data,
                    pool: Arc::clone(self),
                })
            }
            None => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// (acquired, recycled, exhausted)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.acquired.load(Ordering::Relaxed),
            self.stats.recycled.load(Ordering::Relaxed),
            self.stats.exhausted.load(Ordering::Relaxed),
        )
    }
}

pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if self.pool.free.push(data).is_ok() {
            self.pool.stats.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_recycle() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        assert!(c.is_empty());

        drop(b);
        drop(c);
        assert_eq!(pool.stats(), (3, 3, 1));
    }

    #[test]
    fn test_recycled_buffer_is_cleared() {
        let pool = BufferPool::new(1, 8);
        let mut buffer = pool.acquire().unwrap();
        buffer.extend_from_slice(&[1, 2, 3]);
        drop(buffer);
        assert!(pool.acquire().unwrap().is_empty());
    }

    #[test]
    fn test_zero_count_still_usable() {
        let pool = BufferPool::new(0, 8);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.acquire().is_some());
    }
}
