//! Ingest Worker - Main entry point
//!
//! Runs the job runner and the sync scheduler against PostgreSQL and the
//! Airbyte API until SIGINT/SIGTERM.

use std::sync::Arc;

use ingest_core::{
    config::Config,
    db::Database,
    jobs::{JobDispatcher, JobRunner, JobStore, SyncScheduler},
    observability,
    sync::{AirbyteClient, RateLimitedSyncClient, RateLimiter, SyncApi},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("INGEST_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };
    config.validate()?;

    // Initialize observability
    observability::init(&config.observability.service_name, &config.observability)?;
    if let Some(port) = config.observability.metrics_port {
        observability::install_prometheus(port)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Ingest Worker"
    );

    // Connect to database
    let db = Database::connect(&config.database).await?;
    db.migrate().await?;
    let store: Arc<dyn JobStore> = Arc::new(db.job_store());

    // Sync platform client behind rate limits
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()).await?);
    let airbyte = AirbyteClient::new(&config.airbyte)?;
    tracing::info!(base_url = airbyte.base_url(), "Airbyte client created");
    let sync: Arc<dyn SyncApi> = Arc::new(RateLimitedSyncClient::new(airbyte, limiter.clone()));

    // Runner
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        sync.clone(),
        config.retry_policy(),
        config.runner_config(),
    ));
    let runner_handle = runner.start();

    // Scheduler
    let dispatcher = Arc::new(JobDispatcher::new(store).with_sync_api(sync));
    let scheduler = Arc::new(SyncScheduler::from_config(&config.schedules).await?);
    let scheduler_handle = scheduler.start(
        dispatcher,
        config.runner.poll_interval,
        runner_handle.token(),
    );

    // Periodically drop idle rate limit buckets
    let cleanup_token = runner_handle.token();
    let cleanup = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = cleanup_token.cancelled() => break,
                _ = interval.tick() => limiter.cleanup_idle(std::time::Duration::from_secs(3600)),
            }
        }
    });

    shutdown_signal().await;

    let stats = runner_handle.stats().clone();
    runner_handle.shutdown().await;
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler task terminated abnormally");
    }
    if let Err(e) = cleanup.await {
        tracing::error!(error = %e, "Rate limit cleanup task terminated abnormally");
    }

    tracing::info!(
        claimed = stats.claimed(),
        succeeded = stats.succeeded(),
        retried = stats.retried(),
        dead_lettered = stats.dead_lettered(),
        "Worker shutdown complete"
    );

    // Cleanup
    observability::shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
