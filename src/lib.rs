//! wg-knot: stateless UDP relay for WireGuard peers behind NATs
//!
//! The relay forwards native WireGuard datagrams between two peers that
//! cannot reach each other directly, without decrypting anything. It speaks
//! only the outer framing: the message type byte, the ephemeral session
//! indices, and the MAC1 tag of handshake messages. Peers need no
//! configuration change beyond pointing their endpoint at the relay.
//!
//! # Architecture
//!
//! ```text
//! UDP socket ──► receive loop ──► worker pool ──► classifier / MAC1
//!                 (buffer pool)    (bounded queue)       │
//!                                                        ▼
//!                    packet sender ◄── forwarding ◄── peer table
//! ```
//!
//! A single reader copies each datagram's valid prefix into an owned slice
//! and hands it to the worker pool. Workers classify the packet, verify
//! MAC1 against the admitted identities for handshake messages, update the
//! dual-indexed association table, and forward the unchanged bytes. A
//! sweeper evicts associations idle past the configured TTL.
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`io`]: Receive buffer pool
//! - [`relay`]: Classifier, association table, worker pool, server

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod io;
pub mod relay;

pub use config::Config;
pub use error::{ConfigError, RelayError, WgKnotError};
pub use relay::{PeerManager, RelayServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
