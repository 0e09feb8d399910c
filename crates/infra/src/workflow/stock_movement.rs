use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use stockbook_core::TenantId;
use stockbook_events::{Action, DecodedEvent, DocumentLine, DocumentPayload};
use stockbook_inventory::{LedgerEntry, NewLedgerEntry, PartitionKey, Reference, Relation};

use super::{Workflow, WorkflowError};
use crate::rebuild::rebuild_affected;
use crate::store::Transaction;

/// Keeps a document's ledger rows equal to its current lines.
///
/// Create inserts one row per line, update reverses the active rows and
/// inserts the new lines, delete reverses the active rows. Afterwards every
/// touched partition is rebuilt from its earliest touched date.
#[derive(Debug, Clone, Copy, Default)]
pub struct StockMovementWorkflow;

#[async_trait]
impl Workflow for StockMovementWorkflow {
    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        span: &tracing::Span,
        event: &DecodedEvent,
    ) -> Result<(), WorkflowError> {
        let active: Vec<LedgerEntry> = tx
            .entries_for_reference(event.tenant_id, event.reference_type, event.reference_id)
            .await?
            .into_iter()
            .filter(LedgerEntry::is_active)
            .collect();

        let document = match event.action {
            Action::Delete => None,
            Action::Create | Action::Update => Some(event.document.as_ref().ok_or_else(|| {
                WorkflowError::validation(format!("{} {} has no lines", event.reference_type, event.reference_id))
            })?),
        };

        let skip = match (event.action, document) {
            (Action::Create, _) => !active.is_empty(),
            (Action::Update, Some(document)) => already_applied(&active, document),
            _ => false,
        };
        if skip {
            debug!(parent: span, rows = active.len(), "document already in ledger");
            return Ok(());
        }
        if let Some(document) = document {
            validate_document(tx, event.tenant_id, document).await?;
        }

        let now = Utc::now();
        let mut touched: BTreeMap<PartitionKey, NaiveDate> = BTreeMap::new();
        let mut touch = |key: PartitionKey, on: NaiveDate| {
            touched
                .entry(key)
                .and_modify(|d| *d = (*d).min(on))
                .or_insert(on);
        };

        if event.action != Action::Create {
            for row in &active {
                let reversal = NewLedgerEntry::reversal_of(row, format!("{} {}", event.action, event.event_id))?;
                touch(reversal.partition_key(), reversal.transaction_date);
                tx.append_entry(reversal, now).await?;
            }
        }

        if let Some(document) = document {
            for line in &document.lines {
                let entry = new_entry(event, document.transaction_date, line);
                touch(entry.partition_key(), entry.transaction_date);
                tx.append_entry(entry, now).await?;
            }
        }

        let reports = rebuild_affected(
            tx,
            event.tenant_id,
            touched,
            [(event.reference_type, event.reference_id)],
        )
        .await?;

        info!(
            parent: span,
            action = %event.action,
            reversed = if event.action == Action::Create { 0 } else { active.len() },
            partitions = reports.len(),
            repriced = reports.iter().map(|r| r.repriced.len()).sum::<usize>(),
            "stock movement applied"
        );
        Ok(())
    }
}

fn new_entry(event: &DecodedEvent, transaction_date: NaiveDate, line: &DocumentLine) -> NewLedgerEntry {
    NewLedgerEntry {
        tenant_id: event.tenant_id,
        warehouse_id: line.warehouse_id,
        product_id: line.product_id,
        product_kind: line.product_kind,
        batch_number: line.batch_number.clone(),
        transaction_date,
        quantity: line.quantity,
        base_unit_cost: line.unit_cost,
        description: line.description.clone(),
        reference: Reference::new(event.reference_type, event.reference_id).with_line(line.line_id),
        is_outgoing: line.quantity.is_sign_negative(),
        is_transfer_in: line.is_transfer_in,
        relation: Relation::Original,
    }
    .normalized()
}

/// Whether the active rows already represent `document` line for line, as
/// after a redelivered update.
///
/// Unit cost is left out: FIFO-priced rows carry a rebuilt cost.
fn already_applied(active: &[LedgerEntry], document: &DocumentPayload) -> bool {
    if active.len() != document.lines.len() {
        return false;
    }
    let mut remaining: Vec<&LedgerEntry> = active.iter().collect();
    document.lines.iter().all(|line| {
        let found = remaining.iter().position(|row| {
            row.reference.line_id == Some(line.line_id)
                && row.transaction_date == document.transaction_date
                && row.product_id == line.product_id
                && row.product_kind == line.product_kind
                && row.warehouse_id == line.warehouse_id
                && row.batch_number == line.batch_number
                && row.quantity == line.quantity
        });
        match found {
            Some(i) => {
                remaining.swap_remove(i);
                true
            }
            None => false,
        }
    })
}

/// Check every line's product, product kind and warehouse against the catalogue.
pub async fn validate_document(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    document: &DocumentPayload,
) -> Result<(), WorkflowError> {
    for line in &document.lines {
        let product = tx.product(tenant_id, line.product_id).await?.ok_or_else(|| {
            WorkflowError::validation(format!("product {} does not exist", line.product_id))
        })?;
        if product.product_kind != line.product_kind {
            return Err(WorkflowError::validation(format!(
                "product {} is {}, line says {}",
                line.product_id, product.product_kind, line.product_kind
            )));
        }
        if !tx.warehouse_exists(tenant_id, line.warehouse_id).await? {
            return Err(WorkflowError::validation(format!(
                "warehouse {} does not exist",
                line.warehouse_id
            )));
        }
    }
    Ok(())
}
