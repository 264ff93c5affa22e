//! edged - fleetsync data-plane daemon
//!
//! Keeps a persistent channel to the control plane, applies pushed
//! configuration snapshots, and restores the last snapshot from its local
//! cache on cold start.

use clap::Parser;
use edged::apply::{Applier, MemorySink};
use edged::cache::LocalCache;
use edged::client::Client;
use edged::config::Config;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose {
        "edged=debug"
    } else {
        "edged=info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!("edged v{} - Fleetsync Data Plane", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let cache = match LocalCache::open(&config.prefix) {
        Ok(cache) => cache,
        Err(e) => {
            error!("Cannot open configuration cache: {e}");
            return ExitCode::FAILURE;
        }
    };
    let applier = Arc::new(Applier::new(Arc::new(MemorySink::new()), cache));

    // Cold start before any connection: serve the last known configuration
    // until the control plane is reachable.
    if let Some(hash) = applier.cold_start() {
        info!(hash = %hash, "configuration restored from local cache");
    }

    let client = match Client::new(&config, applier) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to initialize client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_signal.send(());
    });

    client.run(shutdown_tx).await;
    info!("edged stopped");
    ExitCode::SUCCESS
}
