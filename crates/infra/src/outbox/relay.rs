//! Publish side of the outbox: hands due rows to a [`Publisher`] and tracks
//! the publish lifecycle independently of processing.
//!
//! A batch is claimed in one short transaction by pushing its publish
//! deadline out by `claim_timeout`, published with no transaction open, and
//! the outcome is recorded against a fresh read of each row.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use stockbook_events::{OutboxEvent, Publisher, RetryPolicy};

use crate::store::{Database, StoreError};

const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub sent: usize,
    pub failed: usize,
}

pub struct OutboxRelay<D, P> {
    db: D,
    publisher: P,
    retry: RetryPolicy,
    batch_size: usize,
    claim_timeout: Duration,
}

impl<D: Database, P: Publisher> OutboxRelay<D, P> {
    pub fn new(db: D, publisher: P, retry: RetryPolicy, batch_size: usize) -> Self {
        Self {
            db,
            publisher,
            retry,
            batch_size,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    /// How long a claimed batch stays hidden from other relays.
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Publish one batch of due, unsent events.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RelayOutcome, StoreError> {
        let claimed = self.claim(now).await?;

        let mut results = Vec::with_capacity(claimed.len());
        for event in &claimed {
            let published = self.publisher.publish(event).await;
            results.push((event.id, published));
        }

        let mut outcome = RelayOutcome::default();
        let mut tx = self.db.begin().await?;
        for (id, published) in results {
            // Processing may have moved on while we were publishing.
            let Some(mut event) = tx.outbox_event(id).await? else {
                continue;
            };
            match published {
                Ok(()) => {
                    event.mark_published(now);
                    outcome.sent += 1;
                    debug!(event_id = %id, "outbox event published");
                }
                Err(e) => {
                    event.mark_publish_failed(e.to_string(), &self.retry, now);
                    outcome.failed += 1;
                    warn!(event_id = %id, error = %e, attempts = event.publish.attempts, "publish failed");
                }
            }
            tx.save_outbox(&event).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError> {
        let until = now + chrono::Duration::from_std(self.claim_timeout).unwrap_or_default();
        let mut tx = self.db.begin().await?;
        let mut events = tx.publishable(self.batch_size, now).await?;
        for event in &mut events {
            event.claim_publish(until);
            tx.save_outbox(event).await?;
        }
        tx.commit().await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use stockbook_core::{DocumentId, TenantId};
    use stockbook_events::{
        Action, InMemoryPublisher, OutboxEvent, OutboxEventId, ProcessingStatus, PublishError, PublishStatus,
    };
    use stockbook_inventory::ReferenceType;

    use crate::store::InMemoryDatabase;

    struct Refusing;

    #[async_trait]
    impl Publisher for Refusing {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), PublishError> {
            Err(PublishError::Unavailable("broker down".into()))
        }
    }

    async fn seed(db: &InMemoryDatabase, now: DateTime<Utc>) -> OutboxEventId {
        let mut tx = db.begin().await.unwrap();
        let event = OutboxEvent::new(
            TenantId::new(),
            ReferenceType::Invoice,
            DocumentId::new(),
            Action::Delete,
            serde_json::Value::Null,
            now,
        );
        let id = tx.enqueue(event).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn published_events_are_not_sent_twice() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let id = seed(&db, now).await;

        let publisher = std::sync::Arc::new(InMemoryPublisher::new());
        let subscription = publisher.subscribe();
        let relay = OutboxRelay::new(db.clone(), publisher.clone(), RetryPolicy::default(), 10);

        assert_eq!(relay.run_once(now).await.unwrap().sent, 1);
        assert_eq!(relay.run_once(now).await.unwrap(), RelayOutcome::default());
        assert_eq!(subscription.drain().len(), 1);

        let mut tx = db.begin().await.unwrap();
        let event = tx.outbox_event(id).await.unwrap().unwrap();
        assert_eq!(event.publish.status, PublishStatus::Sent);
        assert_eq!(event.processing.status, Some(ProcessingStatus::Pending));
        assert!(!event.is_processed);
    }

    #[tokio::test]
    async fn publish_failure_backs_off() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let id = seed(&db, now).await;
        let relay = OutboxRelay::new(db.clone(), Refusing, RetryPolicy::fixed(3, Duration::from_secs(30)), 10);

        assert_eq!(relay.run_once(now).await.unwrap().failed, 1);
        assert_eq!(relay.run_once(now).await.unwrap(), RelayOutcome::default());

        let mut tx = db.begin().await.unwrap();
        let event = tx.outbox_event(id).await.unwrap().unwrap();
        assert_eq!(event.publish.status, PublishStatus::Failed);
        assert_eq!(event.publish.last_error.as_deref(), Some("publisher unavailable: broker down"));
        assert_eq!(event.publish.next_attempt_at, now + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn events_stay_unsent_until_someone_subscribes() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let id = seed(&db, now).await;
        let publisher = std::sync::Arc::new(InMemoryPublisher::new());
        let relay = OutboxRelay::new(db.clone(), publisher.clone(), RetryPolicy::fixed(5, Duration::from_secs(1)), 10);

        assert_eq!(relay.run_once(now).await.unwrap().failed, 1);

        let subscription = publisher.subscribe();
        let later = now + chrono::Duration::seconds(2);
        assert_eq!(relay.run_once(later).await.unwrap().sent, 1);
        assert_eq!(subscription.drain().iter().map(|e| e.id).collect::<Vec<_>>(), vec![id]);
    }

    /// Marks the event processed from inside `publish`, which only works if
    /// the relay holds no transaction while publishing.
    struct ProcessingWhilePublishing {
        db: InMemoryDatabase,
    }

    #[async_trait]
    impl Publisher for ProcessingWhilePublishing {
        async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
            let begin = tokio::time::timeout(Duration::from_secs(5), self.db.begin()).await;
            let Ok(Ok(mut tx)) = begin else {
                return Err(PublishError::Unavailable("store locked during publish".into()));
            };
            let mut row = tx.outbox_event(event.id).await.unwrap().unwrap();
            row.mark_succeeded(Utc::now());
            tx.save_outbox(&row).await.unwrap();
            tx.commit().await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishing_runs_outside_the_store_transaction() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let id = seed(&db, now).await;
        let relay = OutboxRelay::new(
            db.clone(),
            ProcessingWhilePublishing { db: db.clone() },
            RetryPolicy::default(),
            10,
        );

        assert_eq!(relay.run_once(now).await.unwrap().sent, 1);

        let mut tx = db.begin().await.unwrap();
        let event = tx.outbox_event(id).await.unwrap().unwrap();
        assert_eq!(event.publish.status, PublishStatus::Sent);
        assert!(event.is_processed, "relay must not overwrite concurrent processing");
        assert_eq!(event.processing.status, Some(ProcessingStatus::Succeeded));
    }

    #[tokio::test]
    async fn claimed_batch_is_hidden_from_other_relays() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let id = seed(&db, now).await;
        let relay = OutboxRelay::new(db.clone(), InMemoryPublisher::new(), RetryPolicy::default(), 10)
            .with_claim_timeout(Duration::from_secs(60));

        let claimed = relay.claim(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(relay.claim(now).await.unwrap().is_empty());
        // An abandoned claim becomes due again.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(relay.claim(later).await.unwrap()[0].id, id);
    }
}
