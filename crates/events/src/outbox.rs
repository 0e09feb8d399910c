//! The outbox row and its two lifecycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockbook_core::{DocumentId, TenantId, string_enum};
use stockbook_inventory::ReferenceType;

use crate::retry::RetryPolicy;

/// Outbox row identifier (UUIDv7, so ids sort by creation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(pub Uuid);

impl OutboxEventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OutboxEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

string_enum!(
    Action,
    "outbox action",
    [
        (Action::Create, "create"),
        (Action::Update, "update"),
        (Action::Delete, "delete"),
    ]
);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PublishStatus {
    Pending,
    Sent,
    Failed,
}

string_enum!(
    PublishStatus,
    "publish status",
    [
        (PublishStatus::Pending, "pending"),
        (PublishStatus::Sent, "sent"),
        (PublishStatus::Failed, "failed"),
    ]
);

/// Raw processing status as stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Dead,
}

string_enum!(
    ProcessingStatus,
    "processing status",
    [
        (ProcessingStatus::Pending, "pending"),
        (ProcessingStatus::Processing, "processing"),
        (ProcessingStatus::Succeeded, "succeeded"),
        (ProcessingStatus::Failed, "failed"),
        (ProcessingStatus::Dead, "dead"),
    ]
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    pub status: PublishStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// `None` for rows written before the column existed.
    pub status: Option<ProcessingStatus>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Who holds an event and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub leased_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.leased_at + timeout > now
    }
}

/// One durable outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub tenant_id: TenantId,
    pub reference_type: ReferenceType,
    pub reference_id: DocumentId,
    pub action: Action,
    /// Document snapshot the workflow applies (lines, date).
    pub payload: serde_json::Value,
    pub publish: PublishState,
    pub processing: ProcessingState,
    pub lease: Option<Lease>,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
        action: Action,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OutboxEventId::new(),
            tenant_id,
            reference_type,
            reference_id,
            action,
            payload,
            publish: PublishState {
                status: PublishStatus::Pending,
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
            },
            processing: ProcessingState {
                status: Some(ProcessingStatus::Pending),
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
            },
            lease: None,
            is_processed: false,
            created_at: now,
            published_at: None,
            processed_at: None,
        }
    }

    /// Whether a worker may claim this row now.
    pub fn is_leasable(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> bool {
        if self.is_processed {
            return false;
        }
        if matches!(
            self.processing.status,
            Some(ProcessingStatus::Dead) | Some(ProcessingStatus::Succeeded)
        ) {
            return false;
        }
        self.processing.next_attempt_at <= now
            && self.lease.as_ref().is_none_or(|l| !l.is_live(now, lease_timeout))
    }

    pub fn mark_leased(&mut self, holder: &str, now: DateTime<Utc>) {
        self.processing.status = Some(ProcessingStatus::Processing);
        self.processing.attempts += 1;
        self.lease = Some(Lease {
            holder: holder.to_string(),
            leased_at: now,
        });
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.processing.status = Some(ProcessingStatus::Succeeded);
        self.processing.last_error = None;
        self.is_processed = true;
        self.processed_at = Some(now);
        self.lease = None;
    }

    /// Record a failed attempt; dead-letters once the policy is exhausted.
    pub fn mark_failed(&mut self, error: impl Into<String>, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.processing.last_error = Some(error.into());
        self.lease = None;
        let status = policy.status_after_failure(self.processing.attempts);
        if status == ProcessingStatus::Failed {
            self.processing.next_attempt_at = policy.next_attempt_at(self.processing.attempts, now);
        }
        self.processing.status = Some(status);
    }

    /// Operator reset: both lifecycles back to pending, due immediately.
    pub fn reset_for_reprocess(&mut self, now: DateTime<Utc>) {
        self.publish.status = PublishStatus::Pending;
        self.publish.attempts = 0;
        self.publish.next_attempt_at = now;
        self.publish.last_error = None;
        self.processing.status = Some(ProcessingStatus::Pending);
        self.processing.attempts = 0;
        self.processing.next_attempt_at = now;
        self.processing.last_error = None;
        self.lease = None;
    }

    pub fn is_publishable(&self, now: DateTime<Utc>) -> bool {
        self.publish.status != PublishStatus::Sent && self.publish.next_attempt_at <= now
    }

    /// Hide the row from other relays until `until` while it is published.
    pub fn claim_publish(&mut self, until: DateTime<Utc>) {
        self.publish.next_attempt_at = until;
    }

    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        self.publish.status = PublishStatus::Sent;
        self.publish.attempts += 1;
        self.publish.last_error = None;
        self.published_at = Some(now);
    }

    pub fn mark_publish_failed(&mut self, error: impl Into<String>, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.publish.status = PublishStatus::Failed;
        self.publish.attempts += 1;
        self.publish.last_error = Some(error.into());
        self.publish.next_attempt_at = policy.next_attempt_at(self.publish.attempts, now);
    }
}
