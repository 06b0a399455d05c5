//! WireGuard outer-header classification and MAC1 verification
//!
//! The relay inspects only the message type byte, the session indices at
//! `[4..12]`, and the MAC1 tag of handshake messages. Everything else is
//! opaque and forwarded verbatim.

use std::fmt;

use blake2::digest::consts::U16;
use blake2::digest::Mac as _;
use blake2::Blake2sMac;
use subtle::ConstantTimeEq;

use crate::error::RelayError;
use crate::relay::key::Mac1Key;

/// Handshake initiation message type byte
pub const MESSAGE_TYPE_INITIATION: u8 = 1;
/// Handshake response message type byte
pub const MESSAGE_TYPE_RESPONSE: u8 = 2;
/// Cookie reply message type byte
pub const MESSAGE_TYPE_COOKIE_REPLY: u8 = 3;
/// Transport data message type byte
pub const MESSAGE_TYPE_TRANSPORT: u8 = 4;

/// Exact length of a handshake initiation
pub const INITIATION_LEN: usize = 148;
/// Exact length of a handshake response
pub const RESPONSE_LEN: usize = 92;
/// Exact length of a cookie reply
pub const COOKIE_REPLY_LEN: usize = 64;
/// Minimum length of a transport data message
pub const TRANSPORT_MIN_LEN: usize = 32;

/// Length of each of the two trailing MACs on a handshake message
pub const MAC_LEN: usize = 16;

/// An ephemeral 4-byte session index
///
/// Each WireGuard endpoint picks its own index per session; the sender index
/// carried in one direction is the receiver index carried in the other, so a
/// single type serves both roles and both table lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionIndex(pub [u8; 4]);

impl SessionIndex {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut index = [0u8; 4];
        index.copy_from_slice(bytes);
        Self(index)
    }
}

impl fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A classified outer WireGuard message, borrowing the received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Handshake initiation (type 1)
    Initiation {
        sender: SessionIndex,
        payload: &'a [u8],
    },
    /// Handshake response (type 2)
    Response {
        sender: SessionIndex,
        receiver: SessionIndex,
        payload: &'a [u8],
    },
    /// Cookie reply (type 3)
    CookieReply {
        receiver: SessionIndex,
        payload: &'a [u8],
    },
    /// Transport data (type 4)
    Transport {
        receiver: SessionIndex,
        payload: &'a [u8],
    },
}

impl<'a> Packet<'a> {
    /// Classify a received datagram by type byte and validate its length
    ///
    /// Bytes 1..4 are reserved zero padding in WireGuard and deliberately
    /// not inspected.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidPacket` on an empty payload, an unknown
    /// type byte, or a length that does not match the type.
    pub fn parse(payload: &'a [u8]) -> Result<Self, RelayError> {
        if payload.is_empty() {
            return Err(RelayError::invalid_packet("insufficient length"));
        }

        match payload[0] {
            MESSAGE_TYPE_INITIATION => {
                if payload.len() != INITIATION_LEN {
                    return Err(RelayError::invalid_packet(
                        "invalid handshake initiation length",
                    ));
                }
                Ok(Self::Initiation {
                    sender: SessionIndex::from_slice(&payload[4..8]),
                    payload,
                })
            }
            MESSAGE_TYPE_RESPONSE => {
                if payload.len() != RESPONSE_LEN {
                    return Err(RelayError::invalid_packet(
                        "invalid handshake response length",
                    ));
                }
                Ok(Self::Response {
                    sender: SessionIndex::from_slice(&payload[4..8]),
                    receiver: SessionIndex::from_slice(&payload[8..12]),
                    payload,
                })
            }
            MESSAGE_TYPE_COOKIE_REPLY => {
                if payload.len() != COOKIE_REPLY_LEN {
                    return Err(RelayError::invalid_packet("invalid cookie reply length"));
                }
                Ok(Self::CookieReply {
                    receiver: SessionIndex::from_slice(&payload[4..8]),
                    payload,
                })
            }
            MESSAGE_TYPE_TRANSPORT => {
                if payload.len() < TRANSPORT_MIN_LEN {
                    return Err(RelayError::invalid_packet("invalid transport data length"));
                }
                Ok(Self::Transport {
                    receiver: SessionIndex::from_slice(&payload[4..8]),
                    payload,
                })
            }
            _ => Err(RelayError::invalid_packet("unknown packet type")),
        }
    }
}

/// Compute the keyed BLAKE2s-128 MAC1 over the covered prefix of a handshake
/// message (everything before the MAC1 field itself)
#[must_use]
pub fn compute_mac1(key: &Mac1Key, covered: &[u8]) -> [u8; MAC_LEN] {
    // A 32-byte key always fits; new_from_slice only rejects oversized keys.
    let mut mac = Blake2sMac::<U16>::new_from_slice(key.as_bytes()).expect("mac1 key length");
    mac.update(covered);
    mac.finalize().into_bytes().into()
}

/// Verify the MAC1 of a handshake message against one candidate key, in
/// constant time
///
/// `payload` must already be length-validated for its type; the last 32
/// bytes are `mac1 ‖ mac2`, each 16 bytes.
#[must_use]
pub fn verify_mac1(key: &Mac1Key, payload: &[u8]) -> bool {
    let mac2_start = payload.len() - MAC_LEN;
    let mac1_start = mac2_start - MAC_LEN;

    let candidate = compute_mac1(key, &payload[..mac1_start]);
    candidate.ct_eq(&payload[mac1_start..mac2_start]).into()
}
