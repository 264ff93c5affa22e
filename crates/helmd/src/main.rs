//! helmd - fleetsync control-plane daemon
//!
//! Holds the authoritative gateway configuration and pushes compressed
//! snapshots to every attached data plane over the mTLS cluster channel.

use clap::Parser;
use helmd::config::Config;
use helmd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose {
        "helmd=debug"
    } else {
        "helmd=info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    info!(
        "helmd v{} - Fleetsync Control Plane",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // SIGHUP marks the configuration export changed and schedules a push.
    let broadcaster = server.broadcaster();
    tokio::spawn(async move {
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            return;
        };
        while hangup.recv().await.is_some() {
            info!("configuration change signalled");
            broadcaster.trigger();
        }
    });

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_server.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
