//! lfcc-server: WebSocket sync server for LFCC documents.
//!
//! Clients hand-shake a policy manifest, catch up from the stored update log,
//! then exchange CRDT updates and presence through the server.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lfcc_server::{Args, Daemon, FileStore, ServerConfig, WebSocketServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,lfcc_server=debug,lfcc_core=debug"
    } else {
        "info,lfcc_server=info,lfcc_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting lfcc-server");
    info!("Data directory: {:?}", args.data_dir);
    info!("Listen address: {}", args.listen);

    let config = ServerConfig::from_args(&args)?;
    let store = FileStore::open(&args.data_dir)
        .await
        .with_context(|| format!("Failed to open data directory {:?}", args.data_dir))?;
    let listener = WebSocketServer::bind(&args.listen).await?;

    let daemon = Daemon::new(config, Arc::new(store));
    info!("Server running. Press Ctrl+C to stop.");

    daemon
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
