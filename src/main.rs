//! pushd push notification delivery daemon.
//!
//! Main entry point. Loads configuration, starts one runner per configured
//! app, feeds due notifications from storage, and drains every queue on
//! shutdown.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use pushd_core::{EventHandler, MulticastEventHandler, SpawningEventHandler, TracingEventHandler};
use pushd_delivery::{
    storage::memory::MemoryStore, AppRunnerRegistry, DeliveryContext, Feeder, NotificationStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pushd");

    let config = DaemonConfig::load()?;
    info!(
        apps = config.apps.len(),
        poll_interval_seconds = config.feeder.poll_interval.as_secs_f64(),
        batch_size = config.feeder.batch_size,
        max_retries = ?config.retry.max_retries,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::with_apps(config.apps.clone()).await);
    let store_handle: Arc<dyn NotificationStore> = store.clone();

    let mut subscribers = MulticastEventHandler::new();
    subscribers.add_subscriber(Arc::new(TracingEventHandler::new()));
    let events: Arc<dyn EventHandler> = Arc::new(SpawningEventHandler::new(Arc::new(subscribers)));

    let ctx = DeliveryContext::new(store_handle.clone(), events)
        .with_retry_policy(config.retry.clone())
        .with_apns_config(config.apns.clone())
        .with_client_config(config.http.clone());

    let registry = Arc::new(AppRunnerRegistry::new(ctx, config.runner.clone()));
    registry.sync_from_store().await.context("Failed to start app runners")?;
    info!(
        runners = registry.runner_count().await,
        dispatchers = registry.num_dispatchers().await,
        "App runners started"
    );

    let feeder = Feeder::new(store_handle, registry.clone(), config.feeder.clone());

    if config.once {
        let report = feeder.enqueue_once().await.context("Failed to fetch notifications")?;
        info!(
            enqueued = report.enqueued,
            skipped_busy = report.skipped_busy,
            dropped_no_runner = report.dropped_no_runner,
            "Single pass enqueued"
        );
    } else {
        let cancel = CancellationToken::new();
        let feeder_handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { feeder.run(cancel).await }
        });

        info!("pushd is delivering notifications");

        shutdown_signal().await?;
        info!("Shutdown signal received, starting graceful shutdown");

        cancel.cancel();
        if let Err(e) = feeder_handle.await {
            error!(error = %e, "Feeder task failed");
        }
    }

    registry.debug().await;
    if let Err(e) = registry.stop().await {
        warn!(error = %e, "App runners did not drain cleanly");
    }

    info!("pushd shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,pushd=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_names(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received CTRL+C signal");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl+C")?;
        info!("Received CTRL+C signal");
    }

    Ok(())
}
