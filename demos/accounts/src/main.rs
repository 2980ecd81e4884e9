//! Entry point for the accounts REST service.
//!
//! Serves `/accounts` over HTTP on top of the event-sourced account store
//! and drains the outbox on background workers until interrupted. Store
//! metrics are exported at `/metrics` unless disabled.

use accounts_demo::api::build_router;
use accounts_demo::build_store;
use accounts_demo::config::ServiceConfig;
use accounts_demo::notifications::build_outbox;
use accounts_demo::storage::AccountStorage;
use accounts_demo::telemetry::{install_metrics, metrics_router};
use ledgerfold::{Processor, ProcessorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the listener cannot
/// be bound, or the server fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = ServiceConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        snapshot_dir = ?config.snapshot_dir,
        snapshot_every = config.snapshot_every,
        outbox_workers = config.outbox_workers,
        metrics_enabled = config.metrics_enabled,
        "configuration loaded"
    );

    let metrics = if config.metrics_enabled {
        Some(install_metrics()?)
    } else {
        None
    };

    let outbox = build_outbox();
    let store = build_store(&config, outbox.clone())?;

    let processor = Processor::new(outbox)
        .with_config(ProcessorConfig {
            workers: config.outbox_workers,
            ..ProcessorConfig::default()
        })
        .start();

    let mut app = build_router(AccountStorage::new(store));
    if let Some(handle) = metrics {
        app = app.merge(metrics_router(handle));
    }
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "accounts API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    processor.shutdown().await;
    info!("accounts API stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
