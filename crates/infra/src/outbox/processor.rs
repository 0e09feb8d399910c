//! Outbox processor with lease, retry and dead-lettering.
//!
//! Each `run_once` leases a batch in its own short transaction, then applies
//! every event in a transaction of its own: the workflow's ledger writes, the
//! rebuild and the outbox status update commit together. A failed workflow
//! rolls back and its failure is recorded in a fresh transaction. Losing that
//! write is logged and the rest of the batch still runs.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use stockbook_events::{DecodedEvent, OutboxEvent, ProcessingStatus, RetryPolicy};

use crate::store::{Database, StoreError, Transaction};
use crate::workflow::{WorkflowError, WorkflowRegistry};

/// Outbox processor configuration.
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Lease holder name, also used for logging
    pub worker_id: String,
    /// Maximum events leased per poll
    pub batch_size: usize,
    /// How often to poll when the outbox is idle
    pub poll_interval: Duration,
    /// A lease older than this is considered abandoned
    pub lease_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            worker_id: "outbox-processor".to_string(),
            batch_size: 20,
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboxProcessorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn lease_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts for one leased batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchOutcome {
    pub leased: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead: usize,
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProcessorStats {
    pub events_processed: u64,
    pub events_succeeded: u64,
    pub events_failed: u64,
    pub events_dead_lettered: u64,
    pub batches: u64,
    pub uptime_secs: u64,
}

impl ProcessorStats {
    fn record(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.events_processed += outcome.leased as u64;
        self.events_succeeded += outcome.succeeded as u64;
        self.events_failed += outcome.failed as u64;
        self.events_dead_lettered += outcome.dead as u64;
    }
}

/// Handle to control a running processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    /// Request graceful shutdown and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("outbox processor already stopped");
        }
        if let Err(e) = self.join.await {
            error!(error = %e, "outbox processor task ended abnormally");
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Leases due outbox events and applies them through registered workflows.
pub struct OutboxProcessor<D> {
    db: D,
    workflows: WorkflowRegistry,
    config: OutboxProcessorConfig,
}

impl<D: Database + 'static> OutboxProcessor<D> {
    pub fn new(db: D, workflows: WorkflowRegistry, config: OutboxProcessorConfig) -> Self {
        Self { db, workflows, config }
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    /// Lease one batch and process it.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchOutcome, ProcessorError> {
        let mut tx = self.db.begin().await?;
        let events = tx
            .lease(
                &self.config.worker_id,
                self.config.batch_size,
                now,
                self.config.lease_timeout_chrono(),
            )
            .await?;
        tx.commit().await?;

        let mut outcome = BatchOutcome {
            leased: events.len(),
            ..BatchOutcome::default()
        };
        for event in events {
            match self.process(event, now).await? {
                ProcessingStatus::Succeeded => outcome.succeeded += 1,
                ProcessingStatus::Dead => outcome.dead += 1,
                _ => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }

    /// Apply one leased event and persist its new lifecycle state.
    async fn process(&self, mut event: OutboxEvent, now: DateTime<Utc>) -> Result<ProcessingStatus, ProcessorError> {
        let span = info_span!(
            "outbox_event",
            worker = %self.config.worker_id,
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            reference_type = %event.reference_type,
            reference_id = %event.reference_id,
            action = %event.action,
            attempt = event.processing.attempts,
        );

        let applied = self.apply(&mut event, &span, now).instrument(span.clone()).await;
        let Err(err) = applied else {
            debug!(parent: &span, "outbox event succeeded");
            return Ok(ProcessingStatus::Succeeded);
        };

        event.mark_failed(err.to_string(), &self.config.retry, now);
        let status = event.processing.status.unwrap_or(ProcessingStatus::Failed);
        if status == ProcessingStatus::Dead {
            warn!(parent: &span, error = %err, "outbox event dead-lettered");
        } else {
            warn!(
                parent: &span,
                error = %err,
                next_attempt_at = %event.processing.next_attempt_at,
                "outbox event failed"
            );
        }

        // The lease stays on the row if this write is lost, so it comes back
        // once the lease times out.
        if let Err(e) = self.record_failure(&event).await {
            error!(parent: &span, error = %e, "failed to record outbox failure");
        }
        Ok(status)
    }

    async fn record_failure(&self, event: &OutboxEvent) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        tx.save_outbox(event).await?;
        tx.commit().await
    }

    async fn apply(&self, event: &mut OutboxEvent, span: &Span, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        let mut tx = self.db.begin().await?;
        match self.run_workflow(&mut *tx, event, span).await {
            Ok(()) => {
                event.mark_succeeded(now);
                tx.save_outbox(event).await?;
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    async fn run_workflow(
        &self,
        tx: &mut dyn Transaction,
        event: &OutboxEvent,
        span: &Span,
    ) -> Result<(), WorkflowError> {
        let decoded = DecodedEvent::decode(event)?;
        let workflow = self.workflows.resolve(event.reference_type)?;
        workflow.apply(tx, span, &decoded).await
    }

    /// Spawn the processor as a background tokio task.
    pub fn spawn(self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let join = tokio::spawn(processor_loop(self, shutdown_rx, stats.clone()));

        ProcessorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn processor_loop<D: Database + 'static>(
    processor: OutboxProcessor<D>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ProcessorStats>>,
) {
    let worker = processor.config.worker_id.clone();
    info!(worker = %worker, "outbox processor started");
    let started = Instant::now();

    while !*shutdown.borrow() {
        let idle = match processor.run_once(Utc::now()).await {
            Ok(outcome) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                    s.uptime_secs = started.elapsed().as_secs();
                }
                if outcome.leased > 0 {
                    debug!(
                        worker = %worker,
                        leased = outcome.leased,
                        succeeded = outcome.succeeded,
                        failed = outcome.failed,
                        dead = outcome.dead,
                        "outbox batch processed"
                    );
                }
                outcome.leased == 0
            }
            Err(e) => {
                error!(worker = %worker, error = %e, "failed to process outbox batch");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(processor.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    info!(worker = %worker, "outbox processor stopped");
}
