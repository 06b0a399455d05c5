//! Configuration types for wg-knot
//!
//! Configuration is loaded from a TOML file (`setting.conf` by default) and
//! can be overridden by `WG_KNOT_*` environment variables and command-line
//! flags. Durations are written as strings with a unit suffix (`90s`, `3m`,
//! `1h30m`).

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "./setting.conf";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Server (listener) configuration
    pub server: ServerConfig,

    /// Admitted public key pairs, base64-encoded
    pub keypairs: Vec<KeyPairConfig>,

    /// Receive buffer pool configuration
    pub buffer_pool: BufferPoolConfig,

    /// Worker pool configuration
    pub worker_pool: WorkerPoolConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// Key pairs are deliberately not validated here: invalid entries are
    /// reported as warnings at load time and only an empty surviving list is
    /// fatal.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be greater than 0".into(),
            ));
        }

        if self.buffer_pool.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_pool.pool_size must be greater than 0".into(),
            ));
        }

        if self.buffer_pool.buffer_size < crate::relay::packet::INITIATION_LEN {
            return Err(ConfigError::ValidationError(format!(
                "buffer_pool.buffer_size must be at least {} bytes to fit a handshake",
                crate::relay::packet::INITIATION_LEN
            )));
        }

        if self.worker_pool.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "worker_pool.max_workers must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP bind address
    pub listen_address: String,

    /// UDP bind port
    pub port: u16,

    /// Log level filter (debug, info, warning, error)
    pub log_level: String,

    /// How long a peer association may stay idle before the sweeper evicts it
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub peer_expiration: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            port: 52820,
            log_level: "info".into(),
            peer_expiration: Duration::from_secs(3 * 60),
        }
    }
}

/// A single admitted key pair, both keys in standard base64
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeyPairConfig {
    pub key1: String,
    pub key2: String,
}

/// Receive buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum number of pooled buffers
    pub pool_size: usize,

    /// Size of each buffer in bytes
    pub buffer_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1000,
            buffer_size: 1500,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of packet-handling workers
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 100 }
    }
}

/// Parse a duration string with unit suffixes: `ms`, `s`, `m`, `h`
///
/// Segments combine, so `1h30m` and `90m` are equal. A bare number without a
/// unit is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::ParseError("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return Err(ConfigError::ParseError(format!("invalid duration: {s}")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| ConfigError::ParseError(format!("invalid duration: {s}")))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let (unit, tail) = rest.split_at(unit_len);
        rest = tail;

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => {
                return Err(ConfigError::ParseError(format!(
                    "invalid duration unit in: {s}"
                )))
            }
        };
    }

    Ok(total)
}

/// Render a duration in the largest unit that divides it evenly
pub fn format_duration(d: Duration) -> String {
    let mut out = String::new();
    if d.subsec_millis() != 0 {
        let _ = write!(out, "{}ms", d.as_millis());
    } else if d.as_secs() % 3600 == 0 && d.as_secs() != 0 {
        let _ = write!(out, "{}h", d.as_secs() / 3600);
    } else if d.as_secs() % 60 == 0 && d.as_secs() != 0 {
        let _ = write!(out, "{}m", d.as_secs() / 60);
    } else {
        let _ = write!(out, "{}s", d.as_secs());
    }
    out
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's serialize_with signature
fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}
