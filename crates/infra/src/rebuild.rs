//! Balance Rebuild Engine.
//!
//! Loads a partition's anchor and working set through the open transaction,
//! reprices FIFO consumption when the window contains any, walks the running
//! balances forward and writes them back. Everything happens inside the
//! caller's transaction, so a failed rebuild rolls back with the business
//! mutation that triggered it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, instrument};

use stockbook_core::{DocumentId, TenantId};
use stockbook_inventory::{CostPosting, LedgerError, PartitionKey, RebuildPlan, ReferenceType, Repriced, fifo};

use crate::store::{StoreError, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Outcome of rebuilding one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub partition: PartitionKey,
    pub from: NaiveDate,
    pub rows_rewritten: usize,
    pub repriced: Vec<Repriced>,
    /// Documents whose rows changed cost during repricing.
    pub affected_references: BTreeSet<(ReferenceType, DocumentId)>,
}

/// Recompute derived fields of every row of `key` dated `from` onward.
#[instrument(skip(tx), fields(partition = %key, from = %from, rows = tracing::field::Empty), err)]
pub async fn rebuild_partition(
    tx: &mut dyn Transaction,
    key: &PartitionKey,
    from: NaiveDate,
) -> Result<RebuildReport, RebuildError> {
    tx.lock_partition(key).await?;

    let anchor = tx.latest_before(key, from).await?;
    let rows = tx.find_partition_from(key, from).await?;
    let mut plan = RebuildPlan::new(key.clone(), from, anchor.as_ref(), rows)?;

    let mut repriced = Vec::new();
    if plan.needs_layers() {
        let history = tx.find_partition_from(key, NaiveDate::MIN).await?;
        repriced = fifo::reprice(&history, from);
        plan.apply(&repriced);
    }

    let updates = plan.walk();
    tx.write_derived(key, &updates).await?;
    tracing::Span::current().record("rows", updates.len());

    let affected_references = plan
        .rows()
        .iter()
        .filter(|row| repriced.iter().any(|r| r.id == row.id))
        .map(|row| (row.reference.reference_type, row.reference.reference_id))
        .collect();

    debug!(repriced = repriced.len(), "partition rebuilt");
    Ok(RebuildReport {
        partition: key.clone(),
        from,
        rows_rewritten: updates.len(),
        repriced,
        affected_references,
    })
}

/// Rebuild each partition from its earliest touched date, then bring the cost
/// postings of every affected document back in line with the ledger.
///
/// `documents` names references that must be re-posted even when repricing
/// left their costs unchanged, typically the document that triggered the
/// rebuild.
pub async fn rebuild_affected(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    partitions: BTreeMap<PartitionKey, NaiveDate>,
    documents: impl IntoIterator<Item = (ReferenceType, DocumentId)>,
) -> Result<Vec<RebuildReport>, RebuildError> {
    let mut reports = Vec::with_capacity(partitions.len());
    let mut to_post: BTreeSet<(ReferenceType, DocumentId)> = documents.into_iter().collect();

    for (key, from) in &partitions {
        let report = rebuild_partition(tx, key, *from).await?;
        to_post.extend(report.affected_references.iter().copied());
        reports.push(report);
    }

    for (reference_type, reference_id) in to_post {
        if !reference_type.posts_cost_of_goods() {
            continue;
        }
        sync_cost_posting(tx, tenant_id, reference_type, reference_id).await?;
    }

    Ok(reports)
}

/// Recompute and store one document's cost-of-goods posting.
pub async fn sync_cost_posting(
    tx: &mut dyn Transaction,
    tenant_id: TenantId,
    reference_type: ReferenceType,
    reference_id: DocumentId,
) -> Result<CostPosting, RebuildError> {
    let entries = tx.entries_for_reference(tenant_id, reference_type, reference_id).await?;
    let posting = CostPosting::from_entries(tenant_id, reference_type, reference_id, &entries);
    tx.upsert_cost_posting(&posting).await?;
    debug!(
        %tenant_id,
        %reference_type,
        %reference_id,
        cost_of_goods = %posting.cost_of_goods,
        "cost posting synced"
    );
    Ok(posting)
}
