use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;

use stockbook_events::InMemoryPublisher;
use stockbook_infra::outbox::{OutboxProcessor, OutboxRelay};
use stockbook_infra::{Database, InMemoryDatabase, PostgresDatabase, StockbookConfig, WorkflowRegistry};
use stockbook_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockbook_observability::tracing::init(LogFormat::from_env());

    let config = StockbookConfig::from_env().context("invalid configuration")?;

    let db: Arc<dyn Database> = match config.database_url.as_deref() {
        Some(url) => {
            let db = PostgresDatabase::connect(url, config.max_connections)
                .await
                .context("failed to connect to DATABASE_URL")?;
            db.apply_schema().await.context("failed to apply schema")?;
            tracing::info!(max_connections = config.max_connections, "using postgres backend");
            Arc::new(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory backend");
            Arc::new(InMemoryDatabase::new())
        }
    };

    let processor = OutboxProcessor::new(db.clone(), WorkflowRegistry::with_stock_movements(), config.processor_config());
    let processor = processor.spawn();

    let publisher = Arc::new(InMemoryPublisher::new());
    let deliveries = publisher.subscribe();
    // Ends once the relay, and with it the publisher, is dropped.
    std::thread::Builder::new()
        .name("outbox-deliveries".into())
        .spawn(move || {
            while let Ok(event) = deliveries.recv() {
                tracing::info!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    reference_type = %event.reference_type,
                    reference_id = %event.reference_id,
                    action = %event.action,
                    "outbox event delivered"
                );
            }
        })
        .context("failed to start delivery log")?;

    let relay = OutboxRelay::new(db.clone(), publisher, config.retry_policy(), config.batch_size);
    let (stop_relay, mut relay_stopped) = watch::channel(false);
    let poll_interval = config.poll_interval;
    let relay_task = tokio::spawn(async move {
        while !*relay_stopped.borrow() {
            match relay.run_once(Utc::now()).await {
                Ok(outcome) if outcome.sent + outcome.failed > 0 => {
                    tracing::debug!(sent = outcome.sent, failed = outcome.failed, "relay batch");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "relay batch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = relay_stopped.changed() => {}
            }
        }
    });

    tracing::info!(worker = %config.worker_id, "stockbook running");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    if let Err(e) = stop_relay.send(true) {
        tracing::warn!(error = %e, "relay already stopped");
    }
    if tokio::time::timeout(Duration::from_secs(10), relay_task).await.is_err() {
        tracing::warn!("relay did not stop in time");
    }
    let stats = processor.stats();
    processor.shutdown().await;
    tracing::info!(
        processed = stats.events_processed,
        succeeded = stats.events_succeeded,
        dead = stats.events_dead_lettered,
        "stockbook stopped"
    );
    Ok(())
}
