//! # lxd-shim
//!
//! LXD-compatible REST/WebSocket server backed by the LXC command-line tools.
//!
//! ## Usage
//!
//! ```text
//! lxd-shim [--config <path>] [--ip <addr>] [--port <port>]
//! ```
//!
//! The configuration file defaults to `config.yaml`; a missing file means
//! built-in defaults. `RUST_LOG` overrides `server.log_level`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use lxd_shim::{serve, AppState};
use lxd_shim_core::ServerConfig;

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    ip: Option<String>,
    port: Option<u16>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .with_context(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--config" | "-c" => args.config = Some(PathBuf::from(value("--config")?)),
            "--ip" => args.ip = Some(value("--ip")?),
            "--port" | "-p" => {
                let raw = value("--port")?;
                args.port = Some(raw.parse().with_context(|| format!("invalid port: {raw}"))?);
            }
            "--help" | "-h" => {
                println!("Usage: lxd-shim [--config <path>] [--ip <addr>] [--port <port>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(args)
}

fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    if !path.exists() {
        return Ok(ServerConfig::default());
    }
    ServerConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = load_config(&config_path)?;
    if let Some(ip) = args.ip {
        config.server.ip = ip;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .init();

    tracing::info!(
        "lxd-shim v{} starting (config: {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;

    let state = AppState::new(config);
    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await
    .map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    tracing::info!("lxd-shim shutting down");

    Ok(())
}
