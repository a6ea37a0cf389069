//! cde tunnel client
//!
//! Connects out to a cde server and exposes the server's ports on local
//! listeners.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cde_client::TunnelClient;
use cde_core::config::{self, ClientConfig, TransportKind};

#[derive(Parser)]
#[command(name = "cde-client")]
#[command(about = "cde tunnel client - exposes remote ports locally")]
#[command(version)]
struct Args {
    /// Server to connect to: ws:// URL, or host:port with --transport tcp
    #[arg(short, long)]
    server: Option<String>,

    /// Remote port to expose locally (repeatable, replaces configured forwards)
    #[arg(long = "forward", value_name = "PORT")]
    forwards: Vec<u16>,

    /// Tunnel transport: websocket or tcp (overrides config)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Exit when the connection drops instead of reconnecting
    #[arg(long)]
    no_reconnect: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("cde client starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_client_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ClientConfig::default()
            })
        } else {
            ClientConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if !args.forwards.is_empty() {
        config.forwards = args.forwards;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if args.no_reconnect {
        config.reconnect = false;
    }
    config.validate().context("Invalid client configuration")?;

    tracing::info!(
        "Connecting to {} over {}, forwarding {:?}",
        config.server_url,
        config.transport,
        config.forwards
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down...");
                cancel_clone.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    TunnelClient::new(config).run(cancel).await?;

    tracing::info!("cde client stopped");
    Ok(())
}
