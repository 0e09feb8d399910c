//! Operator control surface over the outbox.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use stockbook_core::{DocumentId, TenantId};
use stockbook_events::{Action, DocumentPayload, OutboxEvent, OutboxEventId, OutboxStatus};
use stockbook_inventory::ReferenceType;

use crate::store::{StoreError, Transaction};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no matching outbox event for {reference_type} {reference_id}")]
    NotFound {
        reference_type: ReferenceType,
        reference_id: DocumentId,
    },

    #[error("document payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Record a document event in the same transaction as the business mutation.
pub async fn enqueue_document_event(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    reference_type: ReferenceType,
    reference_id: DocumentId,
    action: Action,
    document: Option<&DocumentPayload>,
    now: DateTime<Utc>,
) -> Result<OutboxEventId, ControlError> {
    let payload = match document {
        Some(doc) => serde_json::to_value(doc)?,
        None => serde_json::Value::Null,
    };
    let event = OutboxEvent::new(tenant_id, reference_type, reference_id, action, payload, now);
    Ok(tx.enqueue(event).await?)
}

/// Reset the latest unprocessed event for the key back to pending.
///
/// Succeeded events are processed and therefore never match.
#[instrument(skip(tx), fields(%tenant_id, %reference_type, %reference_id), err)]
pub async fn reprocess(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    reference_type: ReferenceType,
    reference_id: DocumentId,
    now: DateTime<Utc>,
) -> Result<OutboxStatus, ControlError> {
    let mut event = tx
        .latest_unprocessed_outbox(tenant_id, reference_type, reference_id)
        .await?
        .ok_or(ControlError::NotFound {
            reference_type,
            reference_id,
        })?;

    let previous = event.processing.status;
    event.reset_for_reprocess(now);
    tx.save_outbox(&event).await?;
    info!(event_id = %event.id, previous = ?previous, "outbox event reset for reprocessing");
    Ok(OutboxStatus::from(&event))
}

/// Status of the most recent event for the key.
pub async fn outbox_status(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    reference_type: ReferenceType,
    reference_id: DocumentId,
) -> Result<OutboxStatus, ControlError> {
    let event = tx
        .latest_outbox(tenant_id, reference_type, reference_id)
        .await?
        .ok_or(ControlError::NotFound {
            reference_type,
            reference_id,
        })?;
    Ok(OutboxStatus::from(&event))
}
