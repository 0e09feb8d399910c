//! Valuation Query Engine.
//!
//! Read-only projections over the ledger. Rows are fetched through the
//! storage seam and handed to the pure valuation math in
//! `stockbook_inventory::valuation`.

use chrono::NaiveDate;
use tracing::instrument;

use stockbook_core::{ProductId, TenantId, WarehouseId};
use stockbook_inventory::valuation::{closing_rows, closing_rows_from_snapshot, resolve_opening};
use stockbook_inventory::{ClosingRow, ProductKind, ValuationSnapshot};

use crate::store::{Cutoff, LedgerScope, StoreError, Transaction};

/// Parameters of a range valuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuationQuery {
    pub tenant_id: TenantId,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub product_id: ProductId,
    pub product_kind: Option<ProductKind>,
    /// `None` aggregates across warehouses.
    pub warehouse_id: Option<WarehouseId>,
}

/// Parameters of a point-in-time closing report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosingQuery {
    pub tenant_id: TenantId,
    pub at: NaiveDate,
    pub warehouse_id: WarehouseId,
    pub product_id: Option<ProductId>,
    pub product_kind: Option<ProductKind>,
    pub batch_number: Option<String>,
}

/// Opening, closing and running detail for one product over `[from, to]`.
#[instrument(
    skip(tx, query),
    fields(tenant_id = %query.tenant_id, product_id = %query.product_id, from = %query.from, to = %query.to),
    err
)]
pub async fn get_valuation(tx: &mut dyn Transaction, query: &ValuationQuery) -> Result<ValuationSnapshot, StoreError> {
    let scope = LedgerScope::tenant(query.tenant_id)
        .with_product(query.product_id, query.product_kind)
        .with_warehouse(query.warehouse_id);

    let latest_before = tx.latest_per_partition(&scope, Cutoff::Before(query.from)).await?;
    let window = tx.entries_between(&scope, query.from, query.to).await?;

    let on_from: Vec<_> = window
        .iter()
        .filter(|row| row.transaction_date == query.from)
        .cloned()
        .collect();
    let needs_table = latest_before.is_empty()
        && !on_from.iter().any(|row| row.reference.is_opening_stock() && !row.quantity.is_zero());
    let opening_table = if needs_table {
        tx.opening_stock(&scope).await?
    } else {
        Vec::new()
    };

    let (opening, source) = resolve_opening(query.from, &latest_before, &on_from, &opening_table);
    let mut snapshot = ValuationSnapshot::compute(query.from, query.to, opening, source, window);

    let mut references: Vec<_> = snapshot
        .details
        .iter()
        .map(|d| (d.reference.reference_type, d.reference.reference_id))
        .collect();
    references.sort();
    references.dedup();
    let numbers = tx.document_numbers(query.tenant_id, &references).await?;
    for detail in &mut snapshot.details {
        let key = (detail.reference.reference_type, detail.reference.reference_id);
        detail.reference_number = numbers.get(&key).cloned();
    }

    Ok(snapshot)
}

/// Closing quantity and value per product in one warehouse as of `at`.
#[instrument(
    skip(tx, query),
    fields(tenant_id = %query.tenant_id, warehouse_id = %query.warehouse_id, at = %query.at),
    err
)]
pub async fn get_closing_snapshot(tx: &mut dyn Transaction, query: &ClosingQuery) -> Result<Vec<ClosingRow>, StoreError> {
    let mut scope = LedgerScope::tenant(query.tenant_id)
        .with_warehouse(Some(query.warehouse_id))
        .with_batch(query.batch_number.clone());
    scope.product_id = query.product_id;
    scope.product_kind = query.product_kind;

    let products = tx.products(query.tenant_id).await?;

    let warehouse_has_rows = tx
        .has_entries(&LedgerScope::tenant(query.tenant_id).with_warehouse(Some(query.warehouse_id)))
        .await?;
    if !warehouse_has_rows {
        let snapshot = tx.quantity_snapshot(&scope).await?;
        return Ok(closing_rows_from_snapshot(query.warehouse_id, &snapshot, &products));
    }

    let latest = tx.latest_per_partition(&scope, Cutoff::AtOrBefore(query.at)).await?;
    Ok(closing_rows(query.warehouse_id, &latest, &products))
}
