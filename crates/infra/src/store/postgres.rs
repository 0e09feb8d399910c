//! Postgres backend.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (other) | any other | `Backend` |
//! | Decode / ColumnDecode | n/a | `Corrupt` |
//! | Other | n/a | `Backend` |
//!
//! Rebuilds take a transaction-scoped advisory lock keyed on the partition,
//! so two rebuilds of one partition never interleave while different
//! partitions proceed independently.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use stockbook_core::{DocumentId, DocumentLineId, LedgerEntryId, ProductId, StringEnum, TenantId, WarehouseId};
use stockbook_events::{
    Action, Lease, OutboxEvent, OutboxEventId, ProcessingState, ProcessingStatus, PublishState, PublishStatus,
};
use stockbook_inventory::{
    CostPosting, DerivedUpdate, LedgerEntry, NewLedgerEntry, OpeningStock, PartitionKey, PostingLine,
    ProductInfo, ProductKind, QuantitySnapshot, Reference, ReferenceType, Relation, RunningBalance,
};

use super::query::DocumentNumberQuery;
use super::{
    CatalogStore, Cutoff, Database, LedgerScope, LedgerStore, OutboxStore, PostingStore, StoreError,
    Transaction,
};

const SCHEMA: &str = include_str!("../../../../migrations/0001_stockbook.sql");

const LEDGER_COLUMNS: &str = r#"
    id, tenant_id, warehouse_id, product_id, product_kind, batch_number,
    transaction_date, quantity, base_unit_cost, description,
    reference_type, reference_id, reference_line_id,
    is_outgoing, is_transfer_in, reverses_id, reversal_reason, reversed_by, reversed_at,
    closing_quantity, closing_asset_value, cumulative_incoming, cumulative_outgoing,
    sequence, created_at
"#;

const OUTBOX_COLUMNS: &str = r#"
    id, tenant_id, reference_type, reference_id, action, payload,
    publish_status, publish_attempts, publish_next_attempt_at, last_publish_error,
    processing_status, process_attempts, process_next_attempt_at, last_process_error,
    lease_owner, leased_at, is_processed, created_at, published_at, processed_at
"#;

/// Connection pool wrapper; every operation runs inside [`PostgresTransaction`].
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create any missing tables and indexes. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn partition_filter(first_param: usize) -> String {
    let p = first_param;
    format!(
        "tenant_id = ${p} AND warehouse_id = ${} AND product_id = ${} AND product_kind = ${} \
         AND batch_number IS NOT DISTINCT FROM ${}",
        p + 1,
        p + 2,
        p + 3,
        p + 4
    )
}

fn scope_filter(first_param: usize) -> String {
    let p = first_param;
    format!(
        "tenant_id = ${p} AND (${}::uuid IS NULL OR product_id = ${}) \
         AND (${}::text IS NULL OR product_kind = ${}) \
         AND (${}::uuid IS NULL OR warehouse_id = ${}) \
         AND (${}::text IS NULL OR batch_number = ${})",
        p + 1,
        p + 1,
        p + 2,
        p + 2,
        p + 3,
        p + 3,
        p + 4,
        p + 4
    )
}

macro_rules! bind_partition {
    ($query:expr, $key:expr) => {
        $query
            .bind($key.tenant_id.as_uuid())
            .bind($key.warehouse_id.as_uuid())
            .bind($key.product_id.as_uuid())
            .bind($key.product_kind.as_str())
            .bind($key.batch_number.as_deref())
    };
}

macro_rules! bind_scope {
    ($query:expr, $scope:expr) => {
        $query
            .bind($scope.tenant_id.as_uuid())
            .bind($scope.product_id.map(Uuid::from))
            .bind($scope.product_kind.map(|k| k.as_str()))
            .bind($scope.warehouse_id.map(Uuid::from))
            .bind($scope.batch_number.as_deref())
    };
}

impl PostgresTransaction {
    fn ledger_rows(rows: Vec<PgRow>) -> Result<Vec<LedgerEntry>, StoreError> {
        rows.iter()
            .map(|row| {
                LedgerRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_ledger_row", e))?
                    .try_into()
            })
            .collect()
    }

    fn outbox_rows(rows: Vec<PgRow>) -> Result<Vec<OutboxEvent>, StoreError> {
        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_outbox_row", e))?
                    .try_into()
            })
            .collect()
    }

    async fn latest_outbox_row(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
        unprocessed_only: bool,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
             WHERE tenant_id = $1 AND reference_type = $2 AND reference_id = $3 \
               AND (NOT $4 OR is_processed = FALSE) \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(reference_type.as_str())
            .bind(reference_id.as_uuid())
            .bind(unprocessed_only)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_outbox", e))?;
        row.map(|r| Self::outbox_rows(vec![r]).map(|mut v| v.remove(0)))
            .transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresTransaction {
    #[instrument(
        skip(self, entry),
        fields(
            tenant_id = %entry.tenant_id,
            reference_type = %entry.reference.reference_type,
            reference_id = %entry.reference.reference_id
        ),
        err
    )]
    async fn append_entry(&mut self, entry: NewLedgerEntry, now: DateTime<Utc>) -> Result<LedgerEntry, StoreError> {
        let entry = entry.normalized();
        let (reverses_id, reversal_reason) = match &entry.relation {
            Relation::Original => (None, None),
            Relation::Reversal { of, reason } => (Some(of.get()), Some(reason.clone())),
        };

        let sql = format!(
            "INSERT INTO stock_histories (
                tenant_id, warehouse_id, product_id, product_kind, batch_number,
                transaction_date, quantity, base_unit_cost, description,
                reference_type, reference_id, reference_line_id,
                is_outgoing, is_transfer_in, reverses_id, reversal_reason, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             RETURNING {LEDGER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(entry.tenant_id.as_uuid())
            .bind(entry.warehouse_id.as_uuid())
            .bind(entry.product_id.as_uuid())
            .bind(entry.product_kind.as_str())
            .bind(entry.batch_number.as_deref())
            .bind(entry.transaction_date)
            .bind(entry.quantity)
            .bind(entry.base_unit_cost)
            .bind(&entry.description)
            .bind(entry.reference.reference_type.as_str())
            .bind(entry.reference.reference_id.as_uuid())
            .bind(entry.reference.line_id.map(Uuid::from))
            .bind(entry.is_outgoing)
            .bind(entry.is_transfer_in)
            .bind(reverses_id)
            .bind(reversal_reason)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("append_entry", e))?;

        let stored = Self::ledger_rows(vec![row])?.remove(0);

        if let Some(of) = reverses_id {
            // Only an unreversed original in the same partition may be linked.
            let key = entry.partition_key();
            let linked = format!(
                "UPDATE stock_histories SET reversed_by = $6, reversed_at = $7 \
                 WHERE id = $8 AND reversed_by IS NULL AND reverses_id IS NULL AND {}",
                partition_filter(1)
            );
            let result = bind_partition!(sqlx::query(&linked), key)
                .bind(stored.id.get())
                .bind(now)
                .bind(of)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("link_reversal", e))?;
            if result.rows_affected() != 1 {
                return Err(StoreError::Conflict(format!(
                    "ledger entry {of} cannot be reversed by {}",
                    stored.id
                )));
            }
        }

        Ok(stored)
    }

    async fn find_partition_from(&mut self, key: &PartitionKey, from: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_histories WHERE {} AND transaction_date >= $6 \
             ORDER BY transaction_date, is_outgoing, id",
            partition_filter(1)
        );
        let rows = bind_partition!(sqlx::query(&sql), key)
            .bind(from)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_partition_from", e))?;
        Self::ledger_rows(rows)
    }

    async fn latest_before(&mut self, key: &PartitionKey, date: NaiveDate) -> Result<Option<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_histories WHERE {} AND transaction_date < $6 \
             ORDER BY transaction_date DESC, is_outgoing DESC, id DESC LIMIT 1",
            partition_filter(1)
        );
        let rows = bind_partition!(sqlx::query(&sql), key)
            .bind(date)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_before", e))?;
        Ok(Self::ledger_rows(rows)?.pop())
    }

    #[instrument(skip(self), fields(partition = %key), err)]
    async fn lock_partition(&mut self, key: &PartitionKey) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_partition", e))?;
        Ok(())
    }

    #[instrument(skip(self, updates), fields(partition = %key, rows = updates.len()), err)]
    async fn write_derived(&mut self, key: &PartitionKey, updates: &[DerivedUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = updates.iter().map(|u| u.id.get()).collect();
        let costs: Vec<Decimal> = updates.iter().map(|u| u.base_unit_cost).collect();
        let quantities: Vec<Decimal> = updates.iter().map(|u| u.balance.closing_quantity).collect();
        let values: Vec<Decimal> = updates.iter().map(|u| u.balance.closing_asset_value).collect();
        let incoming: Vec<Decimal> = updates.iter().map(|u| u.balance.cumulative_incoming).collect();
        let outgoing: Vec<Decimal> = updates.iter().map(|u| u.balance.cumulative_outgoing).collect();
        let sequences: Vec<i64> = updates.iter().map(|u| u.balance.sequence).collect();

        let sql = format!(
            "UPDATE stock_histories AS s SET
                base_unit_cost = u.cost,
                closing_quantity = u.closing_quantity,
                closing_asset_value = u.closing_value,
                cumulative_incoming = u.incoming,
                cumulative_outgoing = u.outgoing,
                sequence = u.seq
             FROM UNNEST($6::bigint[], $7::numeric[], $8::numeric[], $9::numeric[], $10::numeric[], $11::numeric[], $12::bigint[])
                  AS u(id, cost, closing_quantity, closing_value, incoming, outgoing, seq)
             WHERE s.id = u.id AND {}",
            partition_filter(1)
        );
        let result = bind_partition!(sqlx::query(&sql), key)
            .bind(ids)
            .bind(costs)
            .bind(quantities)
            .bind(values)
            .bind(incoming)
            .bind(outgoing)
            .bind(sequences)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("write_derived", e))?;

        Span::current().record("rows", result.rows_affected());
        if result.rows_affected() != updates.len() as u64 {
            return Err(StoreError::Conflict(format!(
                "rebuild of {key} touched {} of {} rows",
                result.rows_affected(),
                updates.len()
            )));
        }
        Ok(())
    }

    async fn entries_for_reference(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_histories \
             WHERE tenant_id = $1 AND reference_type = $2 AND reference_id = $3 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(reference_type.as_str())
            .bind(reference_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("entries_for_reference", e))?;
        Self::ledger_rows(rows)
    }

    async fn latest_per_partition(&mut self, scope: &LedgerScope, cutoff: Cutoff) -> Result<Vec<LedgerEntry>, StoreError> {
        let (date, inclusive) = match cutoff {
            Cutoff::Before(d) => (d, false),
            Cutoff::AtOrBefore(d) => (d, true),
        };
        let sql = format!(
            "SELECT DISTINCT ON (warehouse_id, product_id, product_kind, batch_number) {LEDGER_COLUMNS} \
             FROM stock_histories \
             WHERE {} AND (transaction_date < $6 OR ($7 AND transaction_date = $6)) \
             ORDER BY warehouse_id, product_id, product_kind, batch_number, \
                      transaction_date DESC, is_outgoing DESC, id DESC",
            scope_filter(1)
        );
        let rows = bind_scope!(sqlx::query(&sql), scope)
            .bind(date)
            .bind(inclusive)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_per_partition", e))?;
        Self::ledger_rows(rows)
    }

    async fn entries_between(
        &mut self,
        scope: &LedgerScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_histories \
             WHERE {} AND transaction_date BETWEEN $6 AND $7 \
             ORDER BY transaction_date, sequence, id",
            scope_filter(1)
        );
        let rows = bind_scope!(sqlx::query(&sql), scope)
            .bind(from)
            .bind(to)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("entries_between", e))?;
        Self::ledger_rows(rows)
    }

    async fn has_entries(&mut self, scope: &LedgerScope) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM stock_histories WHERE {}) AS present",
            scope_filter(1)
        );
        let row = bind_scope!(sqlx::query(&sql), scope)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("has_entries", e))?;
        row.try_get("present").map_err(|e| map_sqlx_error("has_entries", e))
    }
}

#[async_trait]
impl OutboxStore for PostgresTransaction {
    #[instrument(skip(self, event), fields(event_id = %event.id, tenant_id = %event.tenant_id), err)]
    async fn enqueue(&mut self, event: OutboxEvent) -> Result<OutboxEventId, StoreError> {
        sqlx::query(&format!(
            "INSERT INTO outbox_events ({OUTBOX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(event.id.0)
        .bind(event.tenant_id.as_uuid())
        .bind(event.reference_type.as_str())
        .bind(event.reference_id.as_uuid())
        .bind(event.action.as_str())
        .bind(&event.payload)
        .bind(event.publish.status.as_str())
        .bind(event.publish.attempts as i32)
        .bind(event.publish.next_attempt_at)
        .bind(event.publish.last_error.as_deref())
        .bind(event.processing.status.map(|s| s.as_str()))
        .bind(event.processing.attempts as i32)
        .bind(event.processing.next_attempt_at)
        .bind(event.processing.last_error.as_deref())
        .bind(event.lease.as_ref().map(|l| l.holder.as_str()))
        .bind(event.lease.as_ref().map(|l| l.leased_at))
        .bind(event.is_processed)
        .bind(event.created_at)
        .bind(event.published_at)
        .bind(event.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(event.id)
    }

    #[instrument(skip(self), fields(worker = %worker, claimed = tracing::field::Empty), err)]
    async fn lease(
        &mut self,
        worker: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_timeout: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = format!(
            "WITH due AS (
                SELECT id FROM outbox_events
                WHERE is_processed = FALSE
                  AND COALESCE(processing_status, '') NOT IN ('dead', 'succeeded')
                  AND process_next_attempt_at <= $1
                  AND (leased_at IS NULL OR leased_at <= $1 - make_interval(secs => $2))
                ORDER BY process_next_attempt_at, created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
             )
             UPDATE outbox_events AS o
             SET processing_status = 'processing',
                 process_attempts = o.process_attempts + 1,
                 lease_owner = $4,
                 leased_at = $1
             FROM due WHERE o.id = due.id
             RETURNING {}",
            OUTBOX_COLUMNS
                .split(',')
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(lease_timeout.num_milliseconds() as f64 / 1000.0)
            .bind(batch_size as i64)
            .bind(worker)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lease", e))?;

        let mut events = Self::outbox_rows(rows)?;
        events.sort_by_key(|e| (e.processing.next_attempt_at, e.created_at, e.id));
        Span::current().record("claimed", events.len());
        Ok(events)
    }

    async fn save_outbox(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events SET
                publish_status = $2,
                publish_attempts = $3,
                publish_next_attempt_at = $4,
                last_publish_error = $5,
                processing_status = $6,
                process_attempts = $7,
                process_next_attempt_at = $8,
                last_process_error = $9,
                lease_owner = $10,
                leased_at = $11,
                is_processed = $12,
                published_at = $13,
                processed_at = $14
            WHERE id = $1
            "#,
        )
        .bind(event.id.0)
        .bind(event.publish.status.as_str())
        .bind(event.publish.attempts as i32)
        .bind(event.publish.next_attempt_at)
        .bind(event.publish.last_error.as_deref())
        .bind(event.processing.status.map(|s| s.as_str()))
        .bind(event.processing.attempts as i32)
        .bind(event.processing.next_attempt_at)
        .bind(event.processing.last_error.as_deref())
        .bind(event.lease.as_ref().map(|l| l.holder.as_str()))
        .bind(event.lease.as_ref().map(|l| l.leased_at))
        .bind(event.is_processed)
        .bind(event.published_at)
        .bind(event.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_outbox", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox event {}", event.id)));
        }
        Ok(())
    }

    async fn outbox_event(&mut self, id: OutboxEventId) -> Result<Option<OutboxEvent>, StoreError> {
        let row = sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("outbox_event", e))?;
        row.map(|r| Self::outbox_rows(vec![r]).map(|mut v| v.remove(0)))
            .transpose()
    }

    async fn latest_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        self.latest_outbox_row(tenant_id, reference_type, reference_id, false).await
    }

    async fn latest_unprocessed_outbox(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        self.latest_outbox_row(tenant_id, reference_type, reference_id, true).await
    }

    async fn publishable(&mut self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
             WHERE publish_status <> 'sent' AND publish_next_attempt_at <= $1 \
             ORDER BY created_at, id LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(batch_size as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("publishable", e))?;
        Self::outbox_rows(rows)
    }
}

#[async_trait]
impl CatalogStore for PostgresTransaction {
    async fn product(&mut self, tenant_id: TenantId, product_id: ProductId) -> Result<Option<ProductInfo>, StoreError> {
        let row = sqlx::query("SELECT tenant_id, id, product_kind, name, unit FROM products WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn products(&mut self, tenant_id: TenantId) -> Result<Vec<ProductInfo>, StoreError> {
        let rows = sqlx::query("SELECT tenant_id, id, product_kind, name, unit FROM products WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    async fn warehouse_exists(&mut self, tenant_id: TenantId, warehouse_id: WarehouseId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM warehouses WHERE tenant_id = $1 AND id = $2) AS present")
            .bind(tenant_id.as_uuid())
            .bind(warehouse_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("warehouse_exists", e))?;
        row.try_get("present").map_err(|e| map_sqlx_error("warehouse_exists", e))
    }

    async fn opening_stock(&mut self, scope: &LedgerScope) -> Result<Vec<OpeningStock>, StoreError> {
        let sql = format!(
            "SELECT tenant_id, product_id, product_kind, warehouse_id, batch_number, quantity, unit_cost \
             FROM product_opening_stocks WHERE {}",
            scope_filter(1)
        );
        let rows = bind_scope!(sqlx::query(&sql), scope)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("opening_stock", e))?;
        rows.iter()
            .map(|row| {
                Ok(OpeningStock {
                    tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
                    product_id: ProductId::from_uuid(get(row, "product_id")?),
                    product_kind: decode_enum(&get::<String>(row, "product_kind")?)?,
                    warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
                    batch_number: get(row, "batch_number")?,
                    quantity: get(row, "quantity")?,
                    unit_cost: get(row, "unit_cost")?,
                })
            })
            .collect()
    }

    async fn quantity_snapshot(&mut self, scope: &LedgerScope) -> Result<Vec<QuantitySnapshot>, StoreError> {
        let sql = format!(
            "SELECT tenant_id, product_id, product_kind, warehouse_id, batch_number, current_quantity \
             FROM stock_summaries WHERE {}",
            scope_filter(1)
        );
        let rows = bind_scope!(sqlx::query(&sql), scope)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("quantity_snapshot", e))?;
        rows.iter()
            .map(|row| {
                Ok(QuantitySnapshot {
                    tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
                    product_id: ProductId::from_uuid(get(row, "product_id")?),
                    product_kind: decode_enum(&get::<String>(row, "product_kind")?)?,
                    warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
                    batch_number: get(row, "batch_number")?,
                    current_quantity: get(row, "current_quantity")?,
                })
            })
            .collect()
    }

    async fn document_numbers(
        &mut self,
        tenant_id: TenantId,
        references: &[(ReferenceType, DocumentId)],
    ) -> Result<HashMap<(ReferenceType, DocumentId), String>, StoreError> {
        let mut query = DocumentNumberQuery::new(tenant_id);
        for &(rt, id) in references {
            query.add(rt, id);
        }
        if query.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = query.build();
        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("document_numbers", e))?;

        let mut numbers = HashMap::with_capacity(rows.len());
        for row in &rows {
            let rt: ReferenceType = decode_enum(&get::<String>(row, "reference_type")?)?;
            let id = DocumentId::from_uuid(get(row, "reference_id")?);
            if let Some(number) = get::<Option<String>>(row, "reference_number")? {
                numbers.insert((rt, id), number);
            }
        }
        Ok(numbers)
    }
}

#[async_trait]
impl PostingStore for PostgresTransaction {
    async fn upsert_cost_posting(&mut self, posting: &CostPosting) -> Result<(), StoreError> {
        let lines = serde_json::to_value(&posting.lines)
            .map_err(|e| StoreError::Corrupt(format!("posting lines: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO inventory_cost_postings (tenant_id, reference_type, reference_id, cost_of_goods, lines, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (tenant_id, reference_type, reference_id)
            DO UPDATE SET cost_of_goods = EXCLUDED.cost_of_goods, lines = EXCLUDED.lines, updated_at = NOW()
            "#,
        )
        .bind(posting.tenant_id.as_uuid())
        .bind(posting.reference_type.as_str())
        .bind(posting.reference_id.as_uuid())
        .bind(posting.cost_of_goods)
        .bind(lines)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_cost_posting", e))?;
        Ok(())
    }

    async fn cost_posting(
        &mut self,
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<Option<CostPosting>, StoreError> {
        let row = sqlx::query(
            "SELECT cost_of_goods, lines FROM inventory_cost_postings \
             WHERE tenant_id = $1 AND reference_type = $2 AND reference_id = $3",
        )
        .bind(tenant_id.as_uuid())
        .bind(reference_type.as_str())
        .bind(reference_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("cost_posting", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let lines: Vec<PostingLine> = serde_json::from_value(get(&row, "lines")?)
            .map_err(|e| StoreError::Corrupt(format!("posting lines: {e}")))?;
        Ok(Some(CostPosting {
            tenant_id,
            reference_type,
            reference_id,
            cost_of_goods: get(&row, "cost_of_goods")?,
            lines,
        }))
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map an SQLx error into a storage error.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|e| map_sqlx_error(column, e))
}

fn decode_enum<E>(raw: &str) -> Result<E, StoreError>
where
    E: StringEnum,
{
    stockbook_core::codec::decode(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Blank or unknown statuses are rows written before the column existed.
fn decode_processing_status(raw: Option<String>) -> Option<ProcessingStatus> {
    let raw = raw?;
    if raw.trim().is_empty() {
        return None;
    }
    match stockbook_core::codec::decode::<ProcessingStatus>(&raw) {
        Ok(status) => Some(status),
        Err(_) => {
            warn!(status = %raw, "unrecognised processing status treated as legacy");
            None
        }
    }
}

fn product_from_row(row: &PgRow) -> Result<ProductInfo, StoreError> {
    Ok(ProductInfo {
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        product_id: ProductId::from_uuid(get(row, "id")?),
        product_kind: decode_enum::<ProductKind>(&get::<String>(row, "product_kind")?)?,
        name: get(row, "name")?,
        unit: get(row, "unit")?,
    })
}

/// Database representation of a ledger row.
#[derive(Debug)]
struct LedgerRow {
    id: i64,
    tenant_id: Uuid,
    warehouse_id: Uuid,
    product_id: Uuid,
    product_kind: String,
    batch_number: Option<String>,
    transaction_date: NaiveDate,
    quantity: Decimal,
    base_unit_cost: Decimal,
    description: String,
    reference_type: String,
    reference_id: Uuid,
    reference_line_id: Option<Uuid>,
    is_outgoing: bool,
    is_transfer_in: bool,
    reverses_id: Option<i64>,
    reversal_reason: Option<String>,
    reversed_by: Option<i64>,
    reversed_at: Option<DateTime<Utc>>,
    closing_quantity: Decimal,
    closing_asset_value: Decimal,
    cumulative_incoming: Decimal,
    cumulative_outgoing: Decimal,
    sequence: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LedgerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            product_id: row.try_get("product_id")?,
            product_kind: row.try_get("product_kind")?,
            batch_number: row.try_get("batch_number")?,
            transaction_date: row.try_get("transaction_date")?,
            quantity: row.try_get("quantity")?,
            base_unit_cost: row.try_get("base_unit_cost")?,
            description: row.try_get("description")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            reference_line_id: row.try_get("reference_line_id")?,
            is_outgoing: row.try_get("is_outgoing")?,
            is_transfer_in: row.try_get("is_transfer_in")?,
            reverses_id: row.try_get("reverses_id")?,
            reversal_reason: row.try_get("reversal_reason")?,
            reversed_by: row.try_get("reversed_by")?,
            reversed_at: row.try_get("reversed_at")?,
            closing_quantity: row.try_get("closing_quantity")?,
            closing_asset_value: row.try_get("closing_asset_value")?,
            cumulative_incoming: row.try_get("cumulative_incoming")?,
            cumulative_outgoing: row.try_get("cumulative_outgoing")?,
            sequence: row.try_get("sequence")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let relation = match row.reverses_id {
            None => Relation::Original,
            Some(of) => Relation::Reversal {
                of: LedgerEntryId(of),
                reason: row.reversal_reason.unwrap_or_default(),
            },
        };
        let mut reference = Reference::new(
            decode_enum(&row.reference_type)?,
            DocumentId::from_uuid(row.reference_id),
        );
        if let Some(line) = row.reference_line_id {
            reference = reference.with_line(DocumentLineId::from_uuid(line));
        }

        Ok(LedgerEntry {
            id: LedgerEntryId(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            warehouse_id: WarehouseId::from_uuid(row.warehouse_id),
            product_id: ProductId::from_uuid(row.product_id),
            product_kind: decode_enum(&row.product_kind)?,
            batch_number: row.batch_number,
            transaction_date: row.transaction_date,
            quantity: row.quantity,
            base_unit_cost: row.base_unit_cost,
            description: row.description,
            reference,
            is_outgoing: row.is_outgoing,
            is_transfer_in: row.is_transfer_in,
            relation,
            reversed_by: row.reversed_by.map(LedgerEntryId),
            reversed_at: row.reversed_at,
            balance: RunningBalance {
                closing_quantity: row.closing_quantity,
                closing_asset_value: row.closing_asset_value,
                cumulative_incoming: row.cumulative_incoming,
                cumulative_outgoing: row.cumulative_outgoing,
                sequence: row.sequence,
            },
            created_at: row.created_at,
        })
    }
}

/// Database representation of an outbox row.
#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    tenant_id: Uuid,
    reference_type: String,
    reference_id: Uuid,
    action: String,
    payload: serde_json::Value,
    publish_status: String,
    publish_attempts: i32,
    publish_next_attempt_at: DateTime<Utc>,
    last_publish_error: Option<String>,
    processing_status: Option<String>,
    process_attempts: i32,
    process_next_attempt_at: DateTime<Utc>,
    last_process_error: Option<String>,
    lease_owner: Option<String>,
    leased_at: Option<DateTime<Utc>>,
    is_processed: bool,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            action: row.try_get("action")?,
            payload: row.try_get("payload")?,
            publish_status: row.try_get("publish_status")?,
            publish_attempts: row.try_get("publish_attempts")?,
            publish_next_attempt_at: row.try_get("publish_next_attempt_at")?,
            last_publish_error: row.try_get("last_publish_error")?,
            processing_status: row.try_get("processing_status")?,
            process_attempts: row.try_get("process_attempts")?,
            process_next_attempt_at: row.try_get("process_next_attempt_at")?,
            last_process_error: row.try_get("last_process_error")?,
            lease_owner: row.try_get("lease_owner")?,
            leased_at: row.try_get("leased_at")?,
            is_processed: row.try_get("is_processed")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let lease = match (row.lease_owner, row.leased_at) {
            (Some(holder), Some(leased_at)) => Some(Lease { holder, leased_at }),
            _ => None,
        };
        Ok(OutboxEvent {
            id: OutboxEventId(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            reference_type: decode_enum(&row.reference_type)?,
            reference_id: DocumentId::from_uuid(row.reference_id),
            action: decode_enum::<Action>(&row.action)?,
            payload: row.payload,
            publish: PublishState {
                status: decode_enum::<PublishStatus>(&row.publish_status)?,
                attempts: row.publish_attempts.max(0) as u32,
                next_attempt_at: row.publish_next_attempt_at,
                last_error: row.last_publish_error,
            },
            processing: ProcessingState {
                status: decode_processing_status(row.processing_status),
                attempts: row.process_attempts.max(0) as u32,
                next_attempt_at: row.process_next_attempt_at,
                last_error: row.last_process_error,
            },
            lease,
            is_processed: row.is_processed,
            created_at: row.created_at,
            published_at: row.published_at,
            processed_at: row.processed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_filter_numbers_parameters_from_offset() {
        let f = partition_filter(3);
        assert!(f.starts_with("tenant_id = $3"));
        assert!(f.ends_with("batch_number IS NOT DISTINCT FROM $7"));
    }

    #[test]
    fn scope_filter_makes_every_dimension_optional() {
        let f = scope_filter(1);
        assert!(f.contains("($2::uuid IS NULL OR product_id = $2)"));
        assert!(f.contains("($5::text IS NULL OR batch_number = $5)"));
    }

    #[test]
    fn blank_and_unknown_statuses_are_legacy() {
        assert_eq!(decode_processing_status(None), None);
        assert_eq!(decode_processing_status(Some("  ".into())), None);
        assert_eq!(decode_processing_status(Some("archived".into())), None);
        assert_eq!(
            decode_processing_status(Some("DEAD".into())),
            Some(ProcessingStatus::Dead)
        );
    }

    #[test]
    fn closed_pool_is_a_backend_error() {
        let err = map_sqlx_error("x", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
