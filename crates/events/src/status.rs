//! Stable five-state view over raw outbox rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockbook_core::{DocumentId, string_enum};
use stockbook_inventory::ReferenceType;

use crate::outbox::{Action, OutboxEvent, OutboxEventId, ProcessingStatus, PublishStatus};

/// Processing state as reported to callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OutboxState {
    Pending,
    Processing,
    Failed,
    Dead,
    Succeeded,
}

string_enum!(
    OutboxState,
    "outbox state",
    [
        (OutboxState::Pending, "PENDING"),
        (OutboxState::Processing, "PROCESSING"),
        (OutboxState::Failed, "FAILED"),
        (OutboxState::Dead, "DEAD"),
        (OutboxState::Succeeded, "SUCCEEDED"),
    ]
);

impl OutboxState {
    /// Derive the reported state from the raw status column and `is_processed`.
    ///
    /// Rows processed before the status column existed carry a blank status
    /// and only the flag; they report as succeeded.
    pub fn project(raw: Option<ProcessingStatus>, is_processed: bool) -> Self {
        match raw {
            Some(ProcessingStatus::Succeeded) => OutboxState::Succeeded,
            Some(ProcessingStatus::Dead) => OutboxState::Dead,
            _ if is_processed => OutboxState::Succeeded,
            Some(ProcessingStatus::Failed) => OutboxState::Failed,
            Some(ProcessingStatus::Processing) => OutboxState::Processing,
            Some(ProcessingStatus::Pending) | None => OutboxState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxState::Succeeded | OutboxState::Dead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStatus {
    pub event_id: OutboxEventId,
    pub reference_type: ReferenceType,
    pub reference_id: DocumentId,
    pub action: Action,
    pub state: OutboxState,
    pub publish_status: PublishStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&OutboxEvent> for OutboxStatus {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            reference_type: event.reference_type,
            reference_id: event.reference_id,
            action: event.action,
            state: OutboxState::project(event.processing.status, event.is_processed),
            publish_status: event.publish.status,
            attempts: event.processing.attempts,
            last_error: event.processing.last_error.clone(),
            next_attempt_at: event.processing.next_attempt_at,
            is_processed: event.is_processed,
            created_at: event.created_at,
            processed_at: event.processed_at,
        }
    }
}
