//! Receive buffer pool
//!
//! A bounded free-list of fixed-size buffers reused across UDP receives,
//! built on `crossbeam_queue::ArrayQueue` so that getting and returning a
//! buffer never takes a lock.
//!
//! The receive loop reads into a pooled buffer, copies the valid prefix into
//! a freshly owned `Vec` for the worker pool, and drops the `PooledBuffer`,
//! which puts it straight back into the free-list. Peak memory stays bounded
//! at `pool_size * buffer_size` plus the queued jobs' actual packet sizes.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// New allocations (pool was empty)
    allocations: AtomicU64,
    /// Buffers reused from the pool
    reuses: AtomicU64,
    /// Buffers returned to the pool
    returns: AtomicU64,
    /// Buffers discarded because the pool was full
    drops: AtomicU64,
}

impl BufferPoolStats {
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStatsSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub returns: u64,
    pub drops: u64,
}

/// A bounded pool of fixed-size receive buffers
#[derive(Debug)]
pub struct BufferPool {
    /// Free-list of available buffers
    buffers: ArrayQueue<Vec<u8>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a new pool holding at most `pool_size` buffers of `buffer_size`
    /// bytes each. Buffers are allocated lazily on first use.
    #[must_use]
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(pool_size),
            buffer_size,
            stats: BufferPoolStats::default(),
        }
    }

    /// Get a buffer from the pool, allocating a fresh one if the pool is
    /// empty. Never blocks, never fails.
    ///
    /// Reused buffers are not zeroed: the receive syscall overwrites the
    /// prefix, and only that prefix is ever read.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the pool, discarding it when the pool is full
    fn put(&self, buffer: Vec<u8>) {
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_discarded) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Size of each buffer in bytes
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently available in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A buffer borrowed from the pool, returned automatically on drop
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (`Option` so drop can take it)
    buffer: Option<Vec<u8>>,
    /// Owning pool
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.put(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_then_reuses() {
        let pool = Arc::new(BufferPool::new(10, 1500));

        let buf = pool.get();
        assert_eq!(buf.len(), 1500);
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 0);

        drop(buf);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.available(), 1);

        let _buf2 = pool.get();
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_pool_discards_returns() {
        let pool = Arc::new(BufferPool::new(1, 64));

        let buf1 = pool.get();
        let buf2 = pool.get();
        drop(buf1); // fills the single slot
        drop(buf2); // pool full, discarded

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_buffer_is_writable() {
        let pool = Arc::new(BufferPool::new(4, 128));
        let mut buf = pool.get();
        buf[0] = 0xab;
        buf[127] = 0xcd;
        assert_eq!(buf[0], 0xab);
        assert_eq!(buf[127], 0xcd);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool = Arc::new(BufferPool::new(64, 256));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf[0] = 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats().snapshot();
        assert_eq!(stats.allocations + stats.reuses, 800);
    }
}
