//! Configuration loading
//!
//! Precedence, lowest to highest: built-in defaults, TOML file, `WG_KNOT_*`
//! environment variables, command-line flags (applied by the binary after
//! loading).

use std::path::Path;

use tracing::{debug, warn};

use super::types::{parse_duration, Config, KeyPairConfig, DEFAULT_CONFIG_PATH};
use crate::error::ConfigError;

/// Load configuration from a TOML file
///
/// A missing file at the default path is tolerated: the relay can be
/// configured entirely through environment variables and flags. A missing
/// file at an explicitly requested path is an error.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed, or if
/// validation fails.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        if path == Path::new(DEFAULT_CONFIG_PATH) {
            println!(
                "Default configuration file not found. Please specify configuration \
                 using environment variables or command line arguments."
            );
            return Ok(Config::default());
        }
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{e} at {path:?}")))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides applied
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or re-validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Apply `WG_KNOT_*` environment variable overrides
///
/// Unparsable values keep the previous setting and emit a warning; the
/// process does not abort on a bad environment variable.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(addr) = std::env::var("WG_KNOT_LISTEN_ADDRESS") {
        config.server.listen_address = addr;
    }

    override_parsed("WG_KNOT_PORT", &mut config.server.port);

    if let Ok(level) = std::env::var("WG_KNOT_LOG_LEVEL") {
        config.server.log_level = level;
    }

    if let Ok(val) = std::env::var("WG_KNOT_PEER_EXPIRATION") {
        match parse_duration(&val) {
            Ok(d) => config.server.peer_expiration = d,
            Err(e) => warn!("Ignoring WG_KNOT_PEER_EXPIRATION: {}", e),
        }
    }

    override_parsed("WG_KNOT_POOL_SIZE", &mut config.buffer_pool.pool_size);
    override_parsed("WG_KNOT_BUFFER_SIZE", &mut config.buffer_pool.buffer_size);
    override_parsed("WG_KNOT_MAX_WORKERS", &mut config.worker_pool.max_workers);

    if let Ok(val) = std::env::var("WG_KNOT_KEY_PAIRS") {
        for pair in val.split(',') {
            let mut parts = pair.trim().splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(key1), Some(key2)) => config.keypairs.push(KeyPairConfig {
                    key1: key1.trim().to_string(),
                    key2: key2.trim().to_string(),
                }),
                _ => warn!("Ignoring malformed WG_KNOT_KEY_PAIRS entry: {:?}", pair),
            }
        }
    }
}

fn override_parsed<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring {}: invalid value {:?}", name, val),
        }
    }
}
