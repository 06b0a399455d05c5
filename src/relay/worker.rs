//! Worker pool for packet processing
//!
//! A fixed set of workers drains a bounded queue of received datagrams. The
//! queue is multi-producer multi-consumer so every worker pulls from the
//! same backlog; capacity is twice the worker count, and a full queue sheds
//! load at the receive loop instead of blocking it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// Handles one received datagram; implemented by the peer manager
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Process a datagram received from `src`
    async fn handle_packet(&self, src: SocketAddr, payload: &[u8]) -> Result<(), RelayError>;
}

/// One unit of work: a source address and the owned packet bytes
struct PacketJob {
    addr: SocketAddr,
    data: Vec<u8>,
}

/// Statistics for the worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    /// Packets handled across all workers
    packets_processed: AtomicU64,
    /// Bytes handled across all workers
    bytes_received: AtomicU64,
    /// Handler errors (packets logged and dropped)
    handler_errors: AtomicU64,
}

impl WorkerPoolStats {
    #[must_use]
    pub fn packets_processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    fn record_packet(&self, bytes: usize) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> WorkerPoolStatsSnapshot {
        WorkerPoolStatsSnapshot {
            packets_processed: self.packets_processed(),
            bytes_received: self.bytes_received(),
            handler_errors: self.handler_errors(),
        }
    }
}

/// Snapshot of worker pool statistics
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolStatsSnapshot {
    pub packets_processed: u64,
    pub bytes_received: u64,
    pub handler_errors: u64,
}

/// A fixed pool of workers draining a bounded job queue
pub struct WorkerPool {
    /// Producer side of the job queue; `None` once shutdown has begun
    job_tx: Option<flume::Sender<PacketJob>>,
    /// Worker task handles, joined on shutdown
    workers: Vec<JoinHandle<()>>,
    /// Pool statistics
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPool {
    /// Spawn `max_workers` workers (at least one) feeding packets to
    /// `handler`
    #[must_use]
    pub fn new(max_workers: usize, handler: Arc<dyn PacketHandler>) -> Self {
        let max_workers = max_workers.max(1);
        let (job_tx, job_rx) = flume::bounded(max_workers * 2);
        let stats = Arc::new(WorkerPoolStats::default());

        info!("Starting worker pool with {} workers", max_workers);

        let workers = (0..max_workers)
            .map(|id| {
                let job_rx = job_rx.clone();
                let handler = Arc::clone(&handler);
                let stats = Arc::clone(&stats);
                tokio::spawn(Self::worker_loop(id, job_rx, handler, stats))
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            workers,
            stats,
        }
    }

    async fn worker_loop(
        id: usize,
        job_rx: flume::Receiver<PacketJob>,
        handler: Arc<dyn PacketHandler>,
        stats: Arc<WorkerPoolStats>,
    ) {
        debug!("Worker {} started", id);

        // recv_async fails only once the queue is closed and drained, so
        // shutdown lets in-flight jobs finish.
        while let Ok(job) = job_rx.recv_async().await {
            stats.record_packet(job.data.len());
            if let Err(e) = handler.handle_packet(job.addr, &job.data).await {
                stats.record_error();
                error!("Worker {}: failed to handle packet: {}", id, e);
            }
        }

        debug!("Worker {}: job queue closed", id);
    }

    /// Enqueue a packet without blocking
    ///
    /// Returns `false` when the queue is full or the pool is shutting down;
    /// the caller logs the drop.
    #[must_use]
    pub fn submit(&self, addr: SocketAddr, data: Vec<u8>) -> bool {
        match &self.job_tx {
            Some(tx) => tx.try_send(PacketJob { addr, data }).is_ok(),
            None => false,
        }
    }

    /// Close the queue, let the workers drain it, and wait for all of them
    pub async fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }

        for (id, worker) in self.workers.drain(..).enumerate() {
            if let Err(e) = worker.await {
                warn!("Worker {} join error: {}", id, e);
            }
        }

        info!("Worker pool shutdown complete");
    }

    /// Number of workers in the pool
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<WorkerPoolStats> {
        &self.stats
    }

    /// Get a stats snapshot
    #[must_use]
    pub fn stats_snapshot(&self) -> WorkerPoolStatsSnapshot {
        self.stats.snapshot()
    }
}
