//! In-memory backend for tests and development.
//!
//! Transactions are fully serialised: `begin` takes an owned lock on the
//! shared state and works on a private copy. `commit` swaps the copy in,
//! `rollback` (or dropping the transaction) discards it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockbook_core::{DocumentId, LedgerEntryId, ProductId, TenantId, WarehouseId};
use stockbook_events::{OutboxEvent, OutboxEventId};
use stockbook_inventory::{
    CostPosting, DerivedUpdate, LedgerEntry, NewLedgerEntry, OpeningStock, PartitionKey, ProductInfo,
    QuantitySnapshot, ReferenceType, Relation,
};

use super::{
    CatalogStore, Cutoff, Database, LedgerScope, LedgerStore, OutboxStore, PostingStore, StoreError,
    Transaction,
};

type DocumentKey = (TenantId, ReferenceType, DocumentId);

#[derive(Debug, Clone, Default)]
struct State {
    next_entry_id: i64,
    entries: BTreeMap<LedgerEntryId, LedgerEntry>,
    outbox: BTreeMap<OutboxEventId, OutboxEvent>,
    products: Vec<ProductInfo>,
    warehouses: HashSet<(TenantId, WarehouseId)>,
    opening_stocks: Vec<OpeningStock>,
    snapshots: Vec<QuantitySnapshot>,
    postings: HashMap<DocumentKey, CostPosting>,
    document_numbers: HashMap<DocumentKey, String>,
}

impl State {
    fn partition(&self, key: &PartitionKey) -> Vec<LedgerEntry> {
        let mut rows: Vec<LedgerEntry> = self
            .entries
            .values()
            .filter(|e| &e.partition_key() == key)
            .cloned()
            .collect();
        rows.sort_by_key(LedgerEntry::order_key);
        rows
    }

    fn latest_for_key(&self, key: &DocumentKey, unprocessed_only: bool) -> Option<OutboxEvent> {
        self.outbox
            .values()
            .filter(|e| {
                e.tenant_id == key.0 && e.reference_type == key.1 && e.reference_id == key.2
            })
            .filter(|e| !unprocessed_only || !e.is_processed)
            .max_by_key(|e| (e.created_at, e.id))
            .cloned()
    }
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn insert_product(&self, product: ProductInfo) {
        self.state.lock().await.products.push(product);
    }

    pub async fn insert_warehouse(&self, tenant_id: TenantId, warehouse_id: WarehouseId) {
        self.state.lock().await.warehouses.insert((tenant_id, warehouse_id));
    }

    pub async fn insert_opening_stock(&self, row: OpeningStock) {
        self.state.lock().await.opening_stocks.push(row);
    }

    pub async fn insert_quantity_snapshot(&self, row: QuantitySnapshot) {
        self.state.lock().await.snapshots.push(row);
    }

    pub async fn set_document_number(
        &self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
        number: impl Into<String>,
    ) {
        self.state
            .lock()
            .await
            .document_numbers
            .insert((tenant_id, reference_type, reference_id), number.into());
    }

    /// Number of ledger rows across all tenants.
    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, working }))
    }
}

/// Exclusive unit of work over the in-memory state.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl LedgerStore for InMemoryTransaction {
    async fn append_entry(&mut self, entry: NewLedgerEntry, now: DateTime<Utc>) -> Result<LedgerEntry, StoreError> {
        let state = &mut self.working;
        if let Relation::Reversal { of, .. } = &entry.relation {
            let original = state
                .entries
                .get(of)
                .ok_or_else(|| StoreError::NotFound(format!("ledger entry {of}")))?;
            if original.reversed_by.is_some() {
                return Err(StoreError::Conflict(format!("ledger entry {of} is already reversed")));
            }
            if original.relation.reverses().is_some() {
                return Err(StoreError::Conflict(format!("ledger entry {of} is itself a reversal")));
            }
            if original.partition_key() != entry.partition_key() {
                return Err(StoreError::Conflict(format!(
                    "reversal of {of} must stay in partition {}",
                    original.partition_key()
                )));
            }
        }

        state.next_entry_id += 1;
        let id = LedgerEntryId(state.next_entry_id);
        let row = LedgerEntry::from_new(id, entry, now);

        if let Some(of) = row.relation.reverses() {
            if let Some(original) = state.entries.get_mut(&of) {
                original.reversed_by = Some(id);
                original.reversed_at = Some(now);
            }
        }
        state.entries.insert(id, row.clone());
        Ok(row)
    }

    async fn find_partition_from(&mut self, key: &PartitionKey, from: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .partition(key)
            .into_iter()
            .filter(|e| e.transaction_date >= from)
            .collect())
    }

    async fn latest_before(&mut self, key: &PartitionKey, date: NaiveDate) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .partition(key)
            .into_iter()
            .filter(|e| e.transaction_date < date)
            .last())
    }

    async fn lock_partition(&mut self, _key: &PartitionKey) -> Result<(), StoreError> {
        // The transaction already holds the whole state exclusively.
        Ok(())
    }

    async fn write_derived(&mut self, key: &PartitionKey, updates: &[DerivedUpdate]) -> Result<(), StoreError> {
        for update in updates {
            let row = self
                .working
                .entries
                .get_mut(&update.id)
                .ok_or_else(|| StoreError::NotFound(format!("ledger entry {}", update.id)))?;
            if &row.partition_key() != key {
                return Err(StoreError::Conflict(format!(
                    "ledger entry {} is outside partition {key}",
                    update.id
                )));
            }
            row.base_unit_cost = update.base_unit_cost;
            row.balance = update.balance;
        }
        Ok(())
    }

    async fn entries_for_reference(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .entries
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.reference.reference_type == reference_type
                    && e.reference.reference_id == reference_id
            })
            .cloned()
            .collect())
    }

    async fn latest_per_partition(&mut self, scope: &LedgerScope, cutoff: Cutoff) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut latest: BTreeMap<PartitionKey, LedgerEntry> = BTreeMap::new();
        for row in self
            .working
            .entries
            .values()
            .filter(|e| scope.matches(e) && cutoff.admits(e.transaction_date))
        {
            let key = row.partition_key();
            match latest.get(&key) {
                Some(current) if current.order_key() >= row.order_key() => {}
                _ => {
                    latest.insert(key, row.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn entries_between(
        &mut self,
        scope: &LedgerScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .entries
            .values()
            .filter(|e| scope.matches(e) && e.transaction_date >= from && e.transaction_date <= to)
            .cloned()
            .collect())
    }

    async fn has_entries(&mut self, scope: &LedgerScope) -> Result<bool, StoreError> {
        Ok(self.working.entries.values().any(|e| scope.matches(e)))
    }
}

#[async_trait]
impl OutboxStore for InMemoryTransaction {
    async fn enqueue(&mut self, event: OutboxEvent) -> Result<OutboxEventId, StoreError> {
        if self.working.outbox.contains_key(&event.id) {
            return Err(StoreError::Conflict(format!("outbox event {} already exists", event.id)));
        }
        let id = event.id;
        self.working.outbox.insert(id, event);
        Ok(id)
    }

    async fn lease(
        &mut self,
        worker: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_timeout: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut due: Vec<&mut OutboxEvent> = self
            .working
            .outbox
            .values_mut()
            .filter(|e| e.is_leasable(now, lease_timeout))
            .collect();
        due.sort_by_key(|e| (e.processing.next_attempt_at, e.created_at, e.id));

        Ok(due
            .into_iter()
            .take(batch_size)
            .map(|e| {
                e.mark_leased(worker, now);
                e.clone()
            })
            .collect())
    }

    async fn save_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        let slot = self
            .working
            .outbox
            .get_mut(&event.id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {}", event.id)))?;
        *slot = event.clone();
        Ok(())
    }

    async fn outbox_event(&mut self, id: OutboxEventId) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.working.outbox.get(&id).cloned())
    }

    async fn latest_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.working.latest_for_key(&(tenant_id, reference_type, reference_id), false))
    }

    async fn latest_unprocessed_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.working.latest_for_key(&(tenant_id, reference_type, reference_id), true))
    }

    async fn publishable(&mut self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut due: Vec<OutboxEvent> = self
            .working
            .outbox
            .values()
            .filter(|e| e.is_publishable(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.created_at, e.id));
        due.truncate(batch_size);
        Ok(due)
    }
}

#[async_trait]
impl CatalogStore for InMemoryTransaction {
    async fn product(&mut self, tenant_id: TenantId, product_id: ProductId) -> Result<Option<ProductInfo>, StoreError> {
        Ok(self
            .working
            .products
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.product_id == product_id)
            .cloned())
    }

    async fn products(&mut self, tenant_id: TenantId) -> Result<Vec<ProductInfo>, StoreError> {
        Ok(self
            .working
            .products
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn warehouse_exists(&mut self, tenant_id: TenantId, warehouse_id: WarehouseId) -> Result<bool, StoreError> {
        Ok(self.working.warehouses.contains(&(tenant_id, warehouse_id)))
    }

    async fn opening_stock(&mut self, scope: &LedgerScope) -> Result<Vec<OpeningStock>, StoreError> {
        Ok(self
            .working
            .opening_stocks
            .iter()
            .filter(|o| {
                scope.matches_fields(
                    o.tenant_id,
                    o.product_id,
                    o.product_kind,
                    o.warehouse_id,
                    o.batch_number.as_deref(),
                )
            })
            .cloned()
            .collect())
    }

    async fn quantity_snapshot(&mut self, scope: &LedgerScope) -> Result<Vec<QuantitySnapshot>, StoreError> {
        Ok(self
            .working
            .snapshots
            .iter()
            .filter(|s| {
                scope.matches_fields(
                    s.tenant_id,
                    s.product_id,
                    s.product_kind,
                    s.warehouse_id,
                    s.batch_number.as_deref(),
                )
            })
            .cloned()
            .collect())
    }

    async fn document_numbers(
        &mut self,
        tenant_id: TenantId,
        references: &[(ReferenceType, DocumentId)],
    ) -> Result<HashMap<(ReferenceType, DocumentId), String>, StoreError> {
        Ok(references
            .iter()
            .filter_map(|&(rt, id)| {
                self.working
                    .document_numbers
                    .get(&(tenant_id, rt, id))
                    .map(|n| ((rt, id), n.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl PostingStore for InMemoryTransaction {
    async fn upsert_cost_posting(&mut self, posting: &CostPosting) -> Result<(), StoreError> {
        self.working.postings.insert(
            (posting.tenant_id, posting.reference_type, posting.reference_id),
            posting.clone(),
        );
        Ok(())
    }

    async fn cost_posting(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<CostPosting>, StoreError> {
        Ok(self
            .working
            .postings
            .get(&(tenant_id, reference_type, reference_id))
            .cloned())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let working = std::mem::take(&mut self.working);
        *self.guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockbook_events::Action;
    use stockbook_inventory::{ProductKind, Reference};

    fn new_entry(tenant_id: TenantId, warehouse_id: WarehouseId, product_id: ProductId, qty: rust_decimal::Decimal) -> NewLedgerEntry {
        NewLedgerEntry {
            tenant_id,
            warehouse_id,
            product_id,
            product_kind: ProductKind::Single,
            batch_number: None,
            transaction_date: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            quantity: qty,
            base_unit_cost: dec!(10),
            description: String::new(),
            reference: Reference::new(ReferenceType::Bill, DocumentId::new()),
            is_outgoing: false,
            is_transfer_in: false,
            relation: Relation::Original,
        }
    }

    #[tokio::test]
    async fn reversing_a_reversal_is_a_conflict() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let original = tx
            .append_entry(new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(2)), Utc::now())
            .await
            .unwrap();
        let reversal = tx
            .append_entry(NewLedgerEntry::reversal_of(&original, "bill edited").unwrap(), Utc::now())
            .await
            .unwrap();

        let mut again = new_entry(original.tenant_id, original.warehouse_id, original.product_id, dec!(2));
        again.relation = Relation::Reversal {
            of: reversal.id,
            reason: "undo".into(),
        };
        let err = tx.append_entry(again, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err:?}");

        let stored = tx
            .entries_for_reference(original.tenant_id, ReferenceType::Bill, original.reference.reference_id)
            .await
            .unwrap();
        assert!(stored.iter().find(|e| e.id == reversal.id).unwrap().reversed_by.is_none());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.append_entry(new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(1)), Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.entry_count().await, 0);

        let mut tx = db.begin().await.unwrap();
        tx.append_entry(new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(1)), Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.entry_count().await, 1);
    }

    #[tokio::test]
    async fn dropped_transaction_behaves_like_rollback() {
        let db = InMemoryDatabase::new();
        {
            let mut tx = db.begin().await.unwrap();
            tx.append_entry(new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(1)), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(db.entry_count().await, 0);
    }

    #[tokio::test]
    async fn append_overwrites_contradictory_sign_flag() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let mut e = new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(-3));
        e.is_outgoing = false;
        let row = tx.append_entry(e, Utc::now()).await.unwrap();
        assert!(row.is_outgoing);
    }

    #[tokio::test]
    async fn reversal_links_back_reference_once() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let original = tx
            .append_entry(new_entry(TenantId::new(), WarehouseId::new(), ProductId::new(), dec!(2)), Utc::now())
            .await
            .unwrap();
        let reversal = NewLedgerEntry::reversal_of(&original, "edit").unwrap();
        let stored = tx.append_entry(reversal.clone(), Utc::now()).await.unwrap();

        let rows = tx.find_partition_from(&original.partition_key(), NaiveDate::MIN).await.unwrap();
        let linked = rows.iter().find(|r| r.id == original.id).unwrap();
        assert_eq!(linked.reversed_by, Some(stored.id));
        assert!(linked.reversed_at.is_some());

        let err = tx.append_entry(reversal, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn status_reads_pick_the_latest_row() {
        let db = InMemoryDatabase::new();
        let tenant = TenantId::new();
        let doc = DocumentId::new();
        let t0 = Utc::now();

        let mut tx = db.begin().await.unwrap();
        let mut old = OutboxEvent::new(tenant, ReferenceType::Bill, doc, Action::Create, serde_json::Value::Null, t0);
        old.mark_succeeded(t0);
        tx.enqueue(old).await.unwrap();
        let newer = OutboxEvent::new(
            tenant,
            ReferenceType::Bill,
            doc,
            Action::Update,
            serde_json::Value::Null,
            t0 + chrono::Duration::seconds(1),
        );
        let newer_id = tx.enqueue(newer).await.unwrap();

        let latest = tx.latest_outbox(tenant, ReferenceType::Bill, doc).await.unwrap().unwrap();
        assert_eq!(latest.id, newer_id);
        assert_eq!(latest.action, Action::Update);
    }
}
