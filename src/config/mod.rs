//! Configuration loading and types

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_with_env};
pub use types::{
    format_duration, parse_duration, BufferPoolConfig, Config, KeyPairConfig, ServerConfig,
    WorkerPoolConfig, DEFAULT_CONFIG_PATH,
};
