//! Storage seam.
//!
//! Every core operation receives an explicit [`Transaction`]; there is no
//! process-wide handle. A transaction is split into one trait per concern so
//! backends and tests can reason about each surface separately, and
//! [`Transaction`] ties them together with explicit commit and rollback.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use stockbook_core::{DocumentId, ProductId, TenantId, WarehouseId};
use stockbook_events::{OutboxEvent, OutboxEventId};
use stockbook_inventory::{
    CostPosting, DerivedUpdate, LedgerEntry, NewLedgerEntry, OpeningStock, PartitionKey, ProductInfo,
    ProductKind, QuantitySnapshot, ReferenceType,
};

pub mod error;
pub mod in_memory;
pub mod postgres;
pub mod query;

pub use error::StoreError;
pub use in_memory::InMemoryDatabase;
pub use postgres::PostgresDatabase;

/// Which rows a read spans. `None` fields are not filtered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerScope {
    pub tenant_id: TenantId,
    pub product_id: Option<ProductId>,
    pub product_kind: Option<ProductKind>,
    pub warehouse_id: Option<WarehouseId>,
    pub batch_number: Option<String>,
}

impl LedgerScope {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            product_id: None,
            product_kind: None,
            warehouse_id: None,
            batch_number: None,
        }
    }

    pub fn with_product(mut self, product_id: ProductId, product_kind: Option<ProductKind>) -> Self {
        self.product_id = Some(product_id);
        self.product_kind = product_kind;
        self
    }

    pub fn with_warehouse(mut self, warehouse_id: Option<WarehouseId>) -> Self {
        self.warehouse_id = warehouse_id;
        self
    }

    pub fn with_batch(mut self, batch_number: Option<String>) -> Self {
        self.batch_number = batch_number;
        self
    }

    pub fn matches(&self, row: &LedgerEntry) -> bool {
        self.matches_fields(
            row.tenant_id,
            row.product_id,
            row.product_kind,
            row.warehouse_id,
            row.batch_number.as_deref(),
        )
    }

    pub fn matches_fields(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        product_kind: ProductKind,
        warehouse_id: WarehouseId,
        batch_number: Option<&str>,
    ) -> bool {
        self.tenant_id == tenant_id
            && self.product_id.is_none_or(|p| p == product_id)
            && self.product_kind.is_none_or(|k| k == product_kind)
            && self.warehouse_id.is_none_or(|w| w == warehouse_id)
            && self
                .batch_number
                .as_deref()
                .is_none_or(|b| Some(b) == batch_number)
    }
}

/// Upper bound for "latest row per partition" reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cutoff {
    Before(NaiveDate),
    AtOrBefore(NaiveDate),
}

impl Cutoff {
    pub fn admits(self, date: NaiveDate) -> bool {
        match self {
            Cutoff::Before(d) => date < d,
            Cutoff::AtOrBefore(d) => date <= d,
        }
    }
}

/// The stock ledger.
#[async_trait]
pub trait LedgerStore: Send {
    /// Persist one row after enforcing the sign invariant. Derived fields are
    /// left for the rebuild. Appending a reversal links the original's
    /// `reversed_by`; reversing an already reversed row is a conflict.
    async fn append_entry(&mut self, entry: NewLedgerEntry, now: DateTime<Utc>) -> Result<LedgerEntry, StoreError>;

    /// Rows of one partition dated `from` onward, in partition order.
    async fn find_partition_from(&mut self, key: &PartitionKey, from: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Last row of a partition strictly before `date`, in partition order.
    async fn latest_before(&mut self, key: &PartitionKey, date: NaiveDate) -> Result<Option<LedgerEntry>, StoreError>;

    /// Block other rebuilds of this partition until the transaction ends.
    async fn lock_partition(&mut self, key: &PartitionKey) -> Result<(), StoreError>;

    /// Write recomputed derived fields for rows of one partition.
    async fn write_derived(&mut self, key: &PartitionKey, updates: &[DerivedUpdate]) -> Result<(), StoreError>;

    /// All rows produced by one document.
    async fn entries_for_reference(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Latest row per partition within `scope` admitted by `cutoff`.
    async fn latest_per_partition(&mut self, scope: &LedgerScope, cutoff: Cutoff) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Rows within `scope` dated in `[from, to]`.
    async fn entries_between(
        &mut self,
        scope: &LedgerScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn has_entries(&mut self, scope: &LedgerScope) -> Result<bool, StoreError>;
}

/// The outbox table.
#[async_trait]
pub trait OutboxStore: Send {
    async fn enqueue(&mut self, event: OutboxEvent) -> Result<OutboxEventId, StoreError>;

    /// Atomically claim up to `batch_size` due events for `worker`.
    async fn lease(
        &mut self,
        worker: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_timeout: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Overwrite the mutable lifecycle fields of an existing event.
    async fn save_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError>;

    async fn outbox_event(&mut self, id: OutboxEventId) -> Result<Option<OutboxEvent>, StoreError>;

    /// Most recent row for the key, by creation time then id.
    async fn latest_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError>;

    /// Most recent row for the key that is not yet processed.
    async fn latest_unprocessed_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError>;

    /// Due, unsent events for the relay, oldest first.
    async fn publishable(&mut self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError>;
}

/// Read-only collaborator tables.
#[async_trait]
pub trait CatalogStore: Send {
    async fn product(&mut self, tenant_id: TenantId, product_id: ProductId) -> Result<Option<ProductInfo>, StoreError>;

    async fn products(&mut self, tenant_id: TenantId) -> Result<Vec<ProductInfo>, StoreError>;

    async fn warehouse_exists(&mut self, tenant_id: TenantId, warehouse_id: WarehouseId) -> Result<bool, StoreError>;

    async fn opening_stock(&mut self, scope: &LedgerScope) -> Result<Vec<OpeningStock>, StoreError>;

    async fn quantity_snapshot(&mut self, scope: &LedgerScope) -> Result<Vec<QuantitySnapshot>, StoreError>;

    /// Human document numbers for the given references; unknown ones are absent.
    async fn document_numbers(
        &mut self,
        tenant_id: TenantId,
        references: &[(ReferenceType, DocumentId)],
    ) -> Result<HashMap<(ReferenceType, DocumentId), String>, StoreError>;
}

/// Cost-of-goods postings kept in step with the ledger.
#[async_trait]
pub trait PostingStore: Send {
    async fn upsert_cost_posting(&mut self, posting: &CostPosting) -> Result<(), StoreError>;

    async fn cost_posting(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<CostPosting>, StoreError>;
}

/// One unit of work over every table.
#[async_trait]
pub trait Transaction: LedgerStore + OutboxStore + CatalogStore + PostingStore + Send {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

#[async_trait]
impl<D> Database for std::sync::Arc<D>
where
    D: Database + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        (**self).begin().await
    }
}
