//! Error types for wg-knot
//!
//! Startup errors (configuration, socket) are fatal; per-packet errors are
//! logged by the worker that hit them and never propagate further.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for wg-knot
#[derive(Debug, Error)]
pub enum WgKnotError {
    /// Configuration errors (file parsing, key decoding, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Relay errors (packet handling, forwarding, expiration)
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WgKnotError {
    /// Check if this error is recoverable (the relay can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Relay(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Explicitly specified configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// TOML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// A configured public key failed base64 decoding or has the wrong size
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// No key pair survived loading; the relay has nothing to admit
    #[error("No valid public key pairs configured")]
    NoValidKeyPairs,

    /// I/O error while reading the configuration file
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors require user intervention, never recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create an invalid public key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidPublicKey(msg.into())
    }
}

/// Per-packet relay errors
///
/// Every variant except `InvalidExpiration` is raised on the datagram hot
/// path; the worker logs it and drops the packet.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Zero-length payload, unknown type byte, or wrong length for a known type
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// MAC1 matched no admitted key
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No association exists for the forwarding target
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// UDP write failed; surfaced verbatim, never retried
    #[error("Failed to send packet to {dest}: {source}")]
    SendFailed {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The sweeper was asked to run with a non-positive expiration
    #[error("Invalid peer expiration duration: {0:?}")]
    InvalidExpiration(Duration),
}

impl RelayError {
    /// Check if this error is recoverable
    ///
    /// All per-packet errors are recoverable by construction: the packet is
    /// dropped and the relay keeps serving. A misconfigured expiration is
    /// not, it will fail every sweep until the configuration changes.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidExpiration(_))
    }

    /// Create an invalid packet error
    pub fn invalid_packet(detail: impl Into<String>) -> Self {
        Self::InvalidPacket(detail.into())
    }

    /// Create an authentication failure error
    pub fn authentication_failed(detail: impl Into<String>) -> Self {
        Self::AuthenticationFailed(detail.into())
    }

    /// Create a peer not found error
    pub fn peer_not_found(detail: impl Into<String>) -> Self {
        Self::PeerNotFound(detail.into())
    }

    /// Create a send failure error
    pub fn send_failed(dest: SocketAddr, source: io::Error) -> Self {
        Self::SendFailed { dest, source }
    }
}

/// Type alias for Result with WgKnotError
pub type Result<T> = std::result::Result<T, WgKnotError>;
