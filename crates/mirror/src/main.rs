//! Cluster Mirror - cluster, metrics and registry cache
//!
//! This binary runs a single instance per deployment, mirroring cluster
//! state into a local cache, producing periodic health reports and
//! serving read-only views of both.

use anyhow::{Context as _, Result};
use mirror_lib::{
    health::HealthRegistry,
    observability::StructuredLogger,
    runtime::{default_loader, Control, InstanceLock, Scheduler},
    sources::Sources,
    Context, ReportLifecycle, Settings, Store,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

const MIRROR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cluster-mirror");

    // Load configuration
    let settings = Settings::load().context("loading settings")?;
    info!(env = %settings.env, sleep_secs = settings.worker.sleep_secs, "Mirror configured");

    // Refuse to start next to a live instance
    let lock = InstanceLock::acquire(&settings.worker.lock_file)?;

    let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| "cluster-mirror".to_string());
    let logger = StructuredLogger::new(instance);
    logger.log_startup(MIRROR_VERSION, &settings.env);

    // Open the cache and drop anything a crash left half-written
    let store = Arc::new(Store::open(&settings.worker.store_path)?);
    let recovered = ReportLifecycle::new(store.clone()).recover()?;
    if recovered > 0 {
        warn!(count = recovered, "Removed incomplete reports left by a previous run");
    }

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let sources = Sources::connect(&settings).context("connecting sources")?;
    let ctx = Context::new(
        settings.clone(),
        store.clone(),
        sources,
        health_registry.clone(),
        logger.clone(),
    );

    // Start health, metrics and read API server
    let app_state = Arc::new(api::AppState::new(health_registry, store.clone(), &settings));
    let api_handle = tokio::spawn(api::serve(settings.api.port, app_state));

    let control = Control::new();
    let signal_handle = {
        let control = control.clone();
        tokio::spawn(async move { control.listen_for_signals().await })
    };

    let mut scheduler = Scheduler::new(ctx, default_loader());
    let outcome = scheduler.run(&control).await;

    let reason = if signal_handle.is_finished() {
        match signal_handle.await {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                error!(error = %e, "Signal listener failed");
                "signal listener failed"
            }
            Err(_) => "signal listener aborted",
        }
    } else {
        signal_handle.abort();
        "scheduler stopped"
    };

    if let Err(e) = store.persist() {
        error!(error = %e, "Final store persist failed");
    }
    api_handle.abort();
    logger.log_shutdown(reason);
    drop(lock);

    info!("Shutting down");
    outcome.map_err(Into::into)
}
