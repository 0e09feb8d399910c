//! Typed view of an outbox row handed to workflows.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockbook_core::{DocumentId, DocumentLineId, ProductId, TenantId, WarehouseId};
use stockbook_inventory::{ProductKind, ReferenceType};

use crate::outbox::{Action, OutboxEvent, OutboxEventId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{action} event {event_id} carries no document payload")]
    MissingPayload { event_id: OutboxEventId, action: Action },

    #[error("event {event_id} has a malformed payload: {message}")]
    Malformed { event_id: OutboxEventId, message: String },
}

/// One stock-affecting line of a document. Quantity is signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub line_id: DocumentLineId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub warehouse_id: WarehouseId,
    #[serde(default)]
    pub batch_number: Option<String>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    #[serde(default)]
    pub is_transfer_in: bool,
    #[serde(default)]
    pub description: String,
}

/// Document snapshot stored in the outbox payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub transaction_date: NaiveDate,
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event_id: OutboxEventId,
    pub tenant_id: TenantId,
    pub reference_type: ReferenceType,
    pub reference_id: DocumentId,
    pub action: Action,
    /// Absent for deletes enqueued without a snapshot.
    pub document: Option<DocumentPayload>,
}

impl DecodedEvent {
    pub fn decode(event: &OutboxEvent) -> Result<Self, DecodeError> {
        let document = if event.payload.is_null() {
            if event.action != Action::Delete {
                return Err(DecodeError::MissingPayload {
                    event_id: event.id,
                    action: event.action,
                });
            }
            None
        } else {
            let payload = serde_json::from_value::<DocumentPayload>(event.payload.clone())
                .map_err(|e| DecodeError::Malformed {
                    event_id: event.id,
                    message: e.to_string(),
                })?;
            Some(payload)
        };

        Ok(Self {
            event_id: event.id,
            tenant_id: event.tenant_id,
            reference_type: event.reference_type,
            reference_id: event.reference_id,
            action: event.action,
            document,
        })
    }
}
