//! Cadence controller
//!
//! Loads cron schedules from a TOML manifest and keeps reconciling them:
//! workloads are created as slots come due, and each schedule's active set
//! and history are kept in line with the store.

use std::sync::Arc;

use anyhow::Result;
use cadence_controller::{config, manifest, worker::ControllerWorker};
use cadence_events::TracingSink;
use cadence_reconcile::{CronController, KindRegistry, MemoryStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CADENCE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cadence controller");

    let store = Arc::new(MemoryStore::new());
    let keys = match &config.manifest {
        Some(path) => {
            let manifest = match manifest::load(path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!(error = %e, "Failed to load manifest");
                    return Err(e);
                }
            };
            manifest::apply(&manifest, &store).await?
        }
        None => {
            warn!("CADENCE_MANIFEST is not set, no schedules to reconcile");
            Vec::new()
        }
    };
    info!(schedules = keys.len(), "Configuration loaded");

    let kinds = KindRegistry::with_defaults();
    let controller = Arc::new(CronController::new(store, Arc::new(TracingSink), kinds));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ControllerWorker::new(controller, keys, config.worker_config());
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
