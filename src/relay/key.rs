//! Admitted identities and MAC1 key derivation
//!
//! WireGuard derives the key for a handshake message's first MAC from the
//! recipient's static public key: `mac1_key = BLAKE2s-256("mac1----" ‖ pk)`.
//! The relay precomputes this once per admitted key at startup; the mapping
//! is never mutated afterwards.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blake2::{Blake2s256, Digest};
use tracing::warn;

use crate::config::KeyPairConfig;
use crate::error::ConfigError;

/// Label prepended to the public key when deriving the MAC1 key
pub const LABEL_MAC1: &[u8; 8] = b"mac1----";

/// Length of a WireGuard public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// A WireGuard static public key, treated as an opaque 32-byte identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    /// Keys are configured and logged in standard base64
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

/// The precomputed MAC1 verification key for an admitted public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mac1Key(pub [u8; 32]);

impl Mac1Key {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// An admitted pair of public keys allowed to relay to each other
#[derive(Debug, Clone, Copy)]
pub struct KeyPair {
    pub key1: PublicKey,
    pub key2: PublicKey,
}

/// Derive the MAC1 key for a public key
#[must_use]
pub fn derive_mac1_key(public_key: &PublicKey) -> Mac1Key {
    let mut hasher = Blake2s256::new();
    hasher.update(LABEL_MAC1);
    hasher.update(public_key.as_bytes());
    Mac1Key(hasher.finalize().into())
}

/// Decode a base64-encoded public key
///
/// # Errors
///
/// Returns `ConfigError::InvalidPublicKey` on bad base64 or a decoded length
/// other than 32 bytes.
pub fn decode_public_key(encoded: &str) -> Result<PublicKey, ConfigError> {
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| ConfigError::invalid_key(format!("invalid base64 encoding: {encoded:?}")))?;

    let bytes: [u8; PUBLIC_KEY_LEN] = decoded
        .try_into()
        .map_err(|_| ConfigError::invalid_key(format!("incorrect key size: {encoded:?}")))?;

    Ok(PublicKey(bytes))
}

/// Decode the configured key pairs, warning about and skipping invalid
/// entries
///
/// The caller is responsible for treating an empty result as fatal.
#[must_use]
pub fn load_key_pairs(configs: &[KeyPairConfig]) -> Vec<KeyPair> {
    let mut pairs = Vec::with_capacity(configs.len());

    for kp in configs {
        let key1 = match decode_public_key(&kp.key1) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping key pair: {}", e);
                continue;
            }
        };
        let key2 = match decode_public_key(&kp.key2) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping key pair: {}", e);
                continue;
            }
        };
        pairs.push(KeyPair { key1, key2 });
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn test_decode_public_key() {
        let key = decode_public_key(&encode(&[7u8; 32])).unwrap();
        assert_eq!(key.0, [7u8; 32]);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let result = decode_public_key("not!!valid##base64");
        assert!(matches!(result, Err(ConfigError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let result = decode_public_key(&encode(&[7u8; 31]));
        assert!(matches!(result, Err(ConfigError::InvalidPublicKey(_))));

        let result = decode_public_key(&encode(&[7u8; 33]));
        assert!(matches!(result, Err(ConfigError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_display_round_trips() {
        let key = PublicKey([42u8; 32]);
        assert_eq!(decode_public_key(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_mac1_key_is_deterministic_and_key_dependent() {
        let a = PublicKey([1u8; 32]);
        let b = PublicKey([2u8; 32]);

        assert_eq!(derive_mac1_key(&a), derive_mac1_key(&a));
        assert_ne!(derive_mac1_key(&a), derive_mac1_key(&b));
    }

    #[test]
    fn test_load_key_pairs_skips_invalid_entries() {
        let configs = vec![
            KeyPairConfig {
                key1: encode(&[1u8; 32]),
                key2: encode(&[2u8; 32]),
            },
            KeyPairConfig {
                key1: "garbage".into(),
                key2: encode(&[3u8; 32]),
            },
            KeyPairConfig {
                key1: encode(&[4u8; 32]),
                key2: encode(&[5u8; 16]),
            },
        ];

        let pairs = load_key_pairs(&configs);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key1.0, [1u8; 32]);
        assert_eq!(pairs[0].key2.0, [2u8; 32]);
    }

    #[test]
    fn test_load_key_pairs_empty_input() {
        assert!(load_key_pairs(&[]).is_empty());
    }
}
