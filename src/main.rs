//! tether - relay server for remote-control sessions.
//!
//! Hosts register under a shared-secret password; controllers attach by
//! presenting the same password. The relay forwards traffic between the
//! two sides and enforces lockout, session lifetimes, and trusted-device
//! auto-login. All state is in memory; nothing survives a restart.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether::api;
use tether::config::{ConfigError, RelayConfig, RelayConfigFile};
use tether::relay::Relay;

/// tether - relay server for remote-control sessions.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Args {
    /// Port for the HTTP/WebSocket listener
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: std::net::IpAddr,

    /// Optional TOML file with relay tunables
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Error)]
enum TetherError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), TetherError> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tether=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RelayConfig::default();
    if let Some(path) = &args.config {
        if let Some(file) = RelayConfigFile::load(path)? {
            config = config.merge_file(file);
            tracing::info!(path = %path.display(), "loaded config file");
        }
    }
    // CLI / environment wins over the file.
    if let Some(port) = args.port {
        config.port = port;
    }

    let relay = Arc::new(Relay::new(config.clone()));
    relay.spawn_background_tasks();

    let app = api::router(api::AppState { relay });
    let addr = SocketAddr::new(args.bind, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}
