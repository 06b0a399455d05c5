//! The relay server: UDP socket, receive loop, expiration sweeper
//!
//! Exactly one task reads from the socket. Each receive uses a short
//! deadline so the loop observes the shutdown signal with bounded latency,
//! then copies the valid prefix into an owned slice, returns the pooled
//! buffer, and hands the slice to the worker pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, WgKnotError};
use crate::io::BufferPool;
use crate::relay::key::KeyPair;
use crate::relay::peers::PeerManager;
use crate::relay::sender::UdpPacketSender;
use crate::relay::worker::{PacketHandler, WorkerPool};

/// Read deadline per receive; bounds how long shutdown can go unnoticed
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Fixed period of the expiration sweeper
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Owns every moving part of the relay and runs it to completion
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    buffer_pool: Arc<BufferPool>,
    worker_pool: WorkerPool,
    peer_manager: Arc<PeerManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind the UDP socket and assemble the relay pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address does not resolve or the bind
    /// fails; both are fatal at startup.
    pub async fn bind(config: &Config, key_pairs: &[KeyPair]) -> Result<Self> {
        let bind_addr = format!(
            "{}:{}",
            config.server.listen_address, config.server.port
        );
        let socket = Arc::new(
            UdpSocket::bind(bind_addr.as_str())
                .await
                .map_err(WgKnotError::Io)?,
        );

        let sender = Arc::new(UdpPacketSender::new(Arc::clone(&socket)));
        let peer_manager = Arc::new(PeerManager::new(
            sender,
            key_pairs,
            config.server.peer_expiration,
        ));

        let buffer_pool = Arc::new(BufferPool::new(
            config.buffer_pool.pool_size,
            config.buffer_pool.buffer_size,
        ));
        info!(
            "Buffer pool created: size={}, buffer size={} bytes",
            config.buffer_pool.pool_size, config.buffer_pool.buffer_size
        );

        let worker_pool = WorkerPool::new(
            config.worker_pool.max_workers,
            Arc::clone(&peer_manager) as Arc<dyn PacketHandler>,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            socket,
            buffer_pool,
            worker_pool,
            peer_manager,
            shutdown_tx,
        })
    }

    /// The bound local address
    ///
    /// # Errors
    ///
    /// Propagates the socket's `local_addr` error.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The peer manager driving the association table
    #[must_use]
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    /// A handle that triggers graceful shutdown when sent to
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the sweeper and the receive loop until shutdown is signaled
    ///
    /// # Errors
    ///
    /// Only setup failures surface here; per-packet errors are handled by
    /// the workers.
    pub async fn run(mut self) -> Result<()> {
        let sweeper = self.spawn_sweeper();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            "Started listening for UDP packets: {}",
            self.local_addr()?
        );

        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                // Any signal, even a lagged one, means stop
                Ok(()) | Err(TryRecvError::Lagged(_)) | Err(TryRecvError::Closed) => break,
            }

            let mut buffer = self.buffer_pool.get();

            match tokio::time::timeout(READ_DEADLINE, self.socket.recv_from(&mut buffer[..])).await
            {
                Err(_deadline) => {
                    // Nothing arrived within the deadline; loop to poll
                    // shutdown. The buffer returns to the pool on drop.
                }
                Ok(Err(e)) => {
                    error!("Packet reading error: {}", e);
                }
                Ok(Ok((n, src))) => {
                    let packet = buffer[..n].to_vec();
                    drop(buffer);

                    if !self.worker_pool.submit(src, packet) {
                        warn!("Worker pool queue is full, packet dropped");
                    }
                }
            }
        }

        info!("Shutting down, waiting for worker pool to complete...");
        self.worker_pool.shutdown().await;
        let _ = sweeper.await;

        let worker_stats = self.worker_pool.stats_snapshot();
        let pool_stats = self.buffer_pool.stats().snapshot();
        info!(
            "Final stats: {} packets processed, {} bytes received, {} handler errors, \
             buffer reuse {}/{}",
            worker_stats.packets_processed,
            worker_stats.bytes_received,
            worker_stats.handler_errors,
            pool_stats.reuses,
            pool_stats.reuses + pool_stats.allocations,
        );
        info!("Shutdown complete");

        Ok(())
    }

    /// Periodically evict expired peer associations
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let peer_manager = Arc::clone(&self.peer_manager);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Expiration sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = peer_manager.cleanup_peers() {
                            error!("Failed to cleanup peers: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::key::{derive_mac1_key, PublicKey};
    use crate::relay::packet::{compute_mac1, INITIATION_LEN, MAC_LEN, MESSAGE_TYPE_INITIATION};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.listen_address = "127.0.0.1".into();
        config.server.port = 0;
        config.worker_pool.max_workers = 2;
        config.buffer_pool.pool_size = 8;
        config
    }

    fn initiation(for_key: &PublicKey, sender_index: [u8; 4]) -> Vec<u8> {
        let mut payload = vec![0u8; INITIATION_LEN];
        payload[0] = MESSAGE_TYPE_INITIATION;
        payload[4..8].copy_from_slice(&sender_index);
        let mac1_start = INITIATION_LEN - 2 * MAC_LEN;
        let mac = compute_mac1(&derive_mac1_key(for_key), &payload[..mac1_start]);
        payload[mac1_start..mac1_start + MAC_LEN].copy_from_slice(&mac);
        payload
    }

    #[tokio::test]
    async fn test_bind_and_clean_shutdown() {
        let key_pairs = [KeyPair {
            key1: PublicKey([1u8; 32]),
            key2: PublicKey([2u8; 32]),
        }];
        let server = RelayServer::bind(&test_config(), &key_pairs).await.unwrap();
        let shutdown = server.shutdown_handle();

        let task = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("shutdown timed out")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relays_initiation_between_sockets() {
        let key_a = PublicKey([1u8; 32]);
        let key_b = PublicKey([2u8; 32]);
        let key_pairs = [KeyPair {
            key1: key_a,
            key2: key_b,
        }];

        let server = RelayServer::bind(&test_config(), &key_pairs).await.unwrap();
        let relay_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        let peer_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Peer A introduces itself with an initiation addressed to B's
        // identity; the relay learns A's endpoint from it.
        peer_a
            .send_to(&initiation(&key_b, [1, 0, 0, 1]), relay_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Peer B's initiation for A's identity must now reach peer A.
        let packet = initiation(&key_a, [2, 0, 0, 2]);
        peer_b.send_to(&packet, relay_addr).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer_a.recv_from(&mut buf))
            .await
            .expect("relay did not forward the initiation")
            .unwrap();

        assert_eq!(from, relay_addr);
        assert_eq!(&buf[..n], &packet[..]);

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("shutdown timed out")
            .unwrap()
            .unwrap();
    }
}
