//! indexer-worker: the index-build worker node binary.
//!
//! Loads config, starts the node (scheduler + stage runners), then waits for
//! a shutdown signal. Build submissions arrive through the control-plane
//! surface wired in by the deployment; this binary owns only the lifecycle.

use clap::Parser;
use tracing::{info, warn};

use vektor_indexer::{IndexNode, IndexerConfig};

/// Index-build worker with bounded task scheduling for vector index builds.
#[derive(Parser, Debug)]
#[command(name = "indexer-worker", version, about)]
struct Cli {
    /// Path to indexer.toml config file.
    #[arg(long, env = "VEKTOR_CONFIG", default_value = "config/indexer.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match IndexerConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded indexer config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config,
                "failed to load config, using defaults"
            );
            IndexerConfig::default()
        }
    };

    let node = IndexNode::new(&config);
    node.start();
    info!(
        capacity = config.scheduler.queue_capacity,
        workers = config.scheduler.workers,
        "indexer-worker ready"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    node.stop().await;
    info!("indexer-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
    }
}
