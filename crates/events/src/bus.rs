//! Publish side of the outbox.
//!
//! The relay hands each outbox row to a [`Publisher`] once; subscribers get
//! at-least-once delivery and must tolerate duplicates.

use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::outbox::OutboxEvent;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}

/// Receiving end handed out by [`InMemoryPublisher::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<OutboxEvent>,
}

impl Subscription {
    /// Block until the next event; errors once the publisher is dropped.
    pub fn recv(&self) -> Result<OutboxEvent, mpsc::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<OutboxEvent, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<OutboxEvent, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything published so far.
    pub fn drain(&self) -> Vec<OutboxEvent> {
        self.receiver.try_iter().collect()
    }
}

/// In-process fan-out publisher for tests and single-node deployments.
///
/// Publishing with no live subscriber is refused, so the row stays unsent.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    subscribers: Mutex<Vec<mpsc::Sender<OutboxEvent>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription { receiver: rx }
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::Unavailable("subscriber list poisoned".into()))?;
        // Drop subscribers whose receiver is gone.
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        if subs.is_empty() {
            return Err(PublishError::Unavailable("no subscribers".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Action;
    use chrono::Utc;
    use stockbook_core::{DocumentId, TenantId};
    use stockbook_inventory::ReferenceType;

    #[tokio::test]
    async fn every_subscriber_receives_a_copy() {
        let bus = InMemoryPublisher::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let event = OutboxEvent::new(
            TenantId::new(),
            ReferenceType::Bill,
            DocumentId::new(),
            Action::Create,
            serde_json::Value::Null,
            Utc::now(),
        );

        bus.publish(&event).await.unwrap();
        assert_eq!(a.drain(), vec![event.clone()]);
        assert_eq!(b.drain(), vec![event]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryPublisher::new();
        drop(bus.subscribe());
        let event = OutboxEvent::new(
            TenantId::new(),
            ReferenceType::Bill,
            DocumentId::new(),
            Action::Delete,
            serde_json::Value::Null,
            Utc::now(),
        );
        let err = bus.publish(&event).await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publishing_to_nobody_is_refused() {
        let bus = InMemoryPublisher::new();
        let event = OutboxEvent::new(
            TenantId::new(),
            ReferenceType::Bill,
            DocumentId::new(),
            Action::Create,
            serde_json::Value::Null,
            Utc::now(),
        );
        assert_eq!(
            bus.publish(&event).await.unwrap_err().to_string(),
            "publisher unavailable: no subscribers"
        );
    }
}
