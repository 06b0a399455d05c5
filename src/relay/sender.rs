//! Send-side wrapper around the relay socket
//!
//! UDP is unreliable by contract and WireGuard retransmits end-to-end, so a
//! failed send is surfaced once and never retried.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::RelayError;

/// The seam between forwarding logic and the socket
///
/// Tests substitute a capturing implementation to observe forwarded
/// datagrams without touching the network.
#[async_trait]
pub trait PacketSender: Send + Sync {
    /// Write `payload` as a single datagram to `to`
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> Result<(), RelayError>;
}

/// Sends datagrams through the relay's UDP socket
pub struct UdpPacketSender {
    socket: Arc<UdpSocket>,
}

impl UdpPacketSender {
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl PacketSender for UdpPacketSender {
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> Result<(), RelayError> {
        self.socket
            .send_to(payload, to)
            .await
            .map_err(|e| RelayError::send_failed(to, e))?;

        debug!("Packet sent: destination={}, size={} bytes", to, payload.len());
        Ok(())
    }
}
