//! wg-knot: stateless UDP relay for WireGuard peers behind NATs
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration file (./setting.conf)
//! wg-knot
//!
//! # Run with an explicit configuration file
//! wg-knot -configfile /etc/wg-knot/setting.conf
//!
//! # Run configured entirely from the environment
//! WG_KNOT_KEY_PAIRS="<base64>:<base64>" WG_KNOT_PORT=52821 wg-knot
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use wg_knot::config::{load_config_with_env, parse_duration, Config, DEFAULT_CONFIG_PATH};
use wg_knot::error::ConfigError;
use wg_knot::relay::{load_key_pairs, RelayServer};

/// Command-line arguments
///
/// Flags take precedence over environment variables, which take precedence
/// over the configuration file.
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    listen: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    peer_expiration: Option<Duration>,
    pool_size: Option<usize>,
    buffer_size: Option<usize>,
    max_workers: Option<usize>,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            config_path: std::env::var("WG_KNOT_CONFIG_FILE")
                .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from),
            listen: None,
            port: None,
            log_level: None,
            peer_expiration: None,
            pool_size: None,
            buffer_size: None,
            max_workers: None,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.trim_start_matches('-') {
                "configfile" if arg.starts_with('-') => {
                    parsed.config_path = PathBuf::from(expect_value(&arg, args.next()));
                }
                "listen" if arg.starts_with('-') => {
                    parsed.listen = Some(expect_value(&arg, args.next()));
                }
                "port" if arg.starts_with('-') => {
                    parsed.port = Some(parse_or_exit(&arg, &expect_value(&arg, args.next())));
                }
                "loglevel" if arg.starts_with('-') => {
                    parsed.log_level = Some(expect_value(&arg, args.next()));
                }
                "peerexpiration" if arg.starts_with('-') => {
                    let value = expect_value(&arg, args.next());
                    match parse_duration(&value) {
                        Ok(duration) => parsed.peer_expiration = Some(duration),
                        Err(e) => {
                            eprintln!("Invalid value for {arg}: {e}");
                            std::process::exit(1);
                        }
                    }
                }
                "poolsize" if arg.starts_with('-') => {
                    parsed.pool_size = Some(parse_or_exit(&arg, &expect_value(&arg, args.next())));
                }
                "buffersize" if arg.starts_with('-') => {
                    parsed.buffer_size =
                        Some(parse_or_exit(&arg, &expect_value(&arg, args.next())));
                }
                "maxworkers" if arg.starts_with('-') => {
                    parsed.max_workers =
                        Some(parse_or_exit(&arg, &expect_value(&arg, args.next())));
                }
                "h" | "help" if arg.starts_with('-') => {
                    print_help();
                    std::process::exit(0);
                }
                "v" | "version" if arg.starts_with('-') => {
                    // The banner has already been printed
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }

    /// Apply flag overrides on top of file and environment values
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.server.listen_address.clone_from(listen);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.server.log_level.clone_from(level);
        }
        if let Some(expiration) = self.peer_expiration {
            config.server.peer_expiration = expiration;
        }
        if let Some(pool_size) = self.pool_size {
            config.buffer_pool.pool_size = pool_size;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_pool.buffer_size = buffer_size;
        }
        if let Some(max_workers) = self.max_workers {
            config.worker_pool.max_workers = max_workers;
        }
    }
}

fn expect_value(flag: &str, value: Option<String>) -> String {
    value.unwrap_or_else(|| {
        eprintln!("Missing value for {flag}");
        std::process::exit(1);
    })
}

fn parse_or_exit<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Invalid value for {flag}: {value}");
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"wg-knot v{}

Stateless UDP relay for WireGuard peers behind NATs.

USAGE:
    wg-knot [OPTIONS]

OPTIONS:
    -configfile <PATH>        Configuration file path [default: {}]
    -listen <ADDR>            IP address to listen on
    -port <PORT>              Port to listen on
    -loglevel <LEVEL>         Log level (debug, info, warning, error)
    -peerexpiration <DUR>     Peer expiration duration (e.g. 3m, 1h)
    -poolsize <N>             Buffer pool size
    -buffersize <BYTES>       Bytes per receive buffer
    -maxworkers <N>           Number of packet-handling workers
    -h, --help                Print help information
    -v, --version             Print version information

ENVIRONMENT:
    WG_KNOT_CONFIG_FILE       Configuration file path
    WG_KNOT_LISTEN_ADDRESS    Listen address
    WG_KNOT_PORT              Listen port
    WG_KNOT_LOG_LEVEL         Log level
    WG_KNOT_PEER_EXPIRATION   Peer expiration duration
    WG_KNOT_POOL_SIZE         Buffer pool size
    WG_KNOT_BUFFER_SIZE       Bytes per receive buffer
    WG_KNOT_MAX_WORKERS       Number of workers
    WG_KNOT_KEY_PAIRS         Comma-separated key1:key2 base64 pairs

Precedence: command line > environment > file > built-in default."#,
        wg_knot::VERSION,
        DEFAULT_CONFIG_PATH,
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level when set.
fn init_logging(config: &Config) {
    let level = match config.server.log_level.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warning" | "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("wg-knot v{}", wg_knot::VERSION);

    let args = Args::parse();

    let mut config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;
    args.apply(&mut config);
    config.validate()?;

    init_logging(&config);

    let key_pairs = load_key_pairs(&config.keypairs);
    if key_pairs.is_empty() {
        error!("{}", ConfigError::NoValidKeyPairs);
        std::process::exit(1);
    }
    info!("Admitted {} public key pair(s)", key_pairs.len());

    let server = RelayServer::bind(&config, &key_pairs)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start UDP listener: {}", e))?;
    let shutdown = server.shutdown_handle();

    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => {
            result??;
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown");
            let _ = shutdown.send(());
            server_task.await??;
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating graceful shutdown");
            let _ = shutdown.send(());
            server_task.await??;
        }
    }

    Ok(())
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
