//! Worker process entrypoint (§5): connect to Postgres, start one
//! [`OutboxPoller`], and run until `ctrl_c`. Mirrors
//! `everruns-worker/src/main.rs`'s shape of env-driven config, a single
//! long-lived component, and a `ctrl_c` shutdown wait.

use std::sync::Arc;

use sagaflow::config::WorkerConfig;
use sagaflow::outbox::OutboxPoller;
use sagaflow::persistence::PostgresSagaStore;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    let _telemetry = sagaflow::telemetry::init(config.otel_endpoint.as_deref());

    tracing::info!(worker_id = %config.worker_id, "sagaflow worker starting");

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    tracing::info!("database connection established");

    let store: Arc<dyn sagaflow::persistence::SagaStore> = Arc::new(PostgresSagaStore::new(pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut poller = OutboxPoller::new(
        store,
        config.worker_id.clone(),
        config.poll_interval_ms,
        config.lease_ttl_ms,
        shutdown_rx,
    );

    let run_handle = tokio::spawn(async move {
        poller.run().await;
    });

    tracing::info!("worker ready, polling for outbox work");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = run_handle.await;

    Ok(())
}
