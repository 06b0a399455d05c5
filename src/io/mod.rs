//! I/O utilities

mod buffer_pool;

pub use buffer_pool::{BufferPool, BufferPoolStats, BufferPoolStatsSnapshot, PooledBuffer};
