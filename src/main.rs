//! waypoint - real-time delivery gateway for map-awareness clients.
//!
//! Runs a WebSocket channel for browser subscriptions and a private TCP
//! control channel for the trusted backend.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use waypoint_server::{Config, GatewayServer};

#[derive(Debug, Parser)]
#[command(name = "waypoint", version, about = "Real-time map-awareness gateway")]
struct Cli {
    /// WebSocket bind host for web clients ('0.0.0.0' lets any client connect)
    #[arg(long)]
    ws_host: Option<String>,

    /// WebSocket bind port (proxy WebSocket traffic here)
    #[arg(long)]
    ws_port: Option<u16>,

    /// TCP control bind host (backend <-> gateway)
    #[arg(long)]
    tcp_host: Option<String>,

    /// TCP control bind port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Debug level 0-3: 0 silent, 1 errors, 2 errors + info, 3 full
    #[arg(long)]
    debug: Option<u8>,

    /// Path to a YAML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // defaults -> config file -> env -> CLI flags
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(host) = cli.ws_host {
        config.client.host = host;
    }
    if let Some(port) = cli.ws_port {
        config.client.port = port;
    }
    if let Some(host) = cli.tcp_host {
        config.control.host = host;
    }
    if let Some(port) = cli.tcp_port {
        config.control.port = port;
    }
    if let Some(level) = cli.debug {
        config.log.verbosity = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.filter_directive())),
        )
        .init();

    tracing::info!("starting waypoint gateway");
    tracing::info!("  client channel: {}:{}", config.client.host, config.client.port);
    tracing::info!("  control channel: {}:{}", config.control.host, config.control.port);
    tracing::info!("  verbosity: {}", config.log.verbosity);

    let server = Arc::new(GatewayServer::new(config));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("server stopped");
    Ok(())
}
