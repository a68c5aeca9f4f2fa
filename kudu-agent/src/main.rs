//! Kudu Agent
//!
//! Long-running coordinator for one site root.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Site: every manager of the root, wired once
//! - Watcher: polls job trees and reports changes to the managers
//! - Scheduler: fires cron-scheduled triggered jobs
//! - Supervisor: keeps continuous jobs running
//!
//! Ctrl-C stops all three and waits for continuous jobs to shut down.

use anyhow::{Context, Result};
use kudu_agent::{Config, Site};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kudu_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kudu Agent");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: root={}, lock_backend={:?}",
        config.root_path.display(),
        config.lock_backend
    );

    let site = Site::open(config.clone())
        .with_context(|| format!("Failed to open site {}", config.root_path.display()))?;

    info!(
        "Scheduler interval: {:?}, watch interval: {:?}, restart interval: {:?}",
        config.scheduler_interval, config.watch_interval, config.restart_interval
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    site.run(shutdown).await;

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
