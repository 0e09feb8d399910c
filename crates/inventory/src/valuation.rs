//! Valuation arithmetic: opening tiers, running detail rows, closing rows.
//!
//! Everything here works on rows already fetched by the query engine, so the
//! fallback order and the running sums can be tested without a store.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{LedgerEntryId, ProductId, WarehouseId};

use crate::catalog::{OpeningStock, ProductInfo, QuantitySnapshot};
use crate::entry::{LedgerEntry, ProductKind, Reference};

/// Quantity on hand and its asset value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub quantity: Decimal,
    pub value: Decimal,
}

impl Balance {
    pub fn new(quantity: Decimal, value: Decimal) -> Self {
        Self { quantity, value }
    }

    pub fn is_zero(&self) -> bool {
        self.quantity.is_zero() && self.value.is_zero()
    }

    fn add(self, quantity: Decimal, value: Decimal) -> Self {
        Self {
            quantity: self.quantity + quantity,
            value: self.value + value,
        }
    }
}

/// Which tier supplied the opening balance. Exactly one tier is ever used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpeningSource {
    /// Closing balances of the latest rows before the window.
    Ledger,
    /// Opening-stock postings dated on the first day of the window.
    OpeningPostings,
    /// The one-time opening-stock source table.
    OpeningStockTable,
    /// Nothing found anywhere.
    Empty,
}

/// Pick the opening balance.
///
/// `latest_before` holds the latest row per partition strictly before `from`.
/// `on_from` holds the window's rows dated `from`. A zero sum in the postings
/// tier is treated as "not posted yet", so a genuinely zero opening posting
/// still falls through to the source table.
pub fn resolve_opening(
    from: NaiveDate,
    latest_before: &[LedgerEntry],
    on_from: &[LedgerEntry],
    opening_table: &[OpeningStock],
) -> (Balance, OpeningSource) {
    if !latest_before.is_empty() {
        let balance = latest_before.iter().fold(Balance::default(), |acc, row| {
            acc.add(row.balance.closing_quantity, row.balance.closing_asset_value)
        });
        return (balance, OpeningSource::Ledger);
    }

    let postings = on_from
        .iter()
        .filter(|row| row.transaction_date == from && row.reference.is_opening_stock())
        .fold(Balance::default(), |acc, row| acc.add(row.quantity, row.movement_value()));
    if !postings.is_zero() {
        return (postings, OpeningSource::OpeningPostings);
    }

    if opening_table.is_empty() {
        return (Balance::default(), OpeningSource::Empty);
    }
    let table = opening_table
        .iter()
        .fold(Balance::default(), |acc, row| acc.add(row.quantity, row.value()));
    (table, OpeningSource::OpeningStockTable)
}

/// One movement inside the reporting window with running totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationDetail {
    pub entry_id: LedgerEntryId,
    pub warehouse_id: WarehouseId,
    pub batch_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub sequence: i64,
    pub reference: Reference,
    /// Human document number, filled in by the query engine when known.
    pub reference_number: Option<String>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub value: Decimal,
    pub stock_on_hand: Decimal,
    pub asset_value: Decimal,
}

/// Opening, closing and running detail rows for a reporting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationSnapshot {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub opening: Balance,
    pub opening_source: OpeningSource,
    pub closing: Balance,
    pub details: Vec<ValuationDetail>,
}

impl ValuationSnapshot {
    /// Assemble the snapshot from the rows dated in `[from, to]`.
    pub fn compute(
        from: NaiveDate,
        to: NaiveDate,
        opening: Balance,
        opening_source: OpeningSource,
        mut window: Vec<LedgerEntry>,
    ) -> Self {
        window.retain(|row| row.transaction_date >= from && row.transaction_date <= to);
        if opening_source == OpeningSource::OpeningPostings {
            window.retain(|row| !(row.transaction_date == from && row.reference.is_opening_stock()));
        }
        window.sort_by_key(|row| (row.transaction_date, row.balance.sequence, row.id));

        let mut running = opening;
        let details: Vec<ValuationDetail> = window
            .into_iter()
            .map(|row| {
                let value = row.movement_value();
                running = running.add(row.quantity, value);
                ValuationDetail {
                    entry_id: row.id,
                    warehouse_id: row.warehouse_id,
                    batch_number: row.batch_number,
                    transaction_date: row.transaction_date,
                    sequence: row.balance.sequence,
                    reference: row.reference,
                    reference_number: None,
                    description: row.description,
                    quantity: row.quantity,
                    unit_cost: row.base_unit_cost,
                    value,
                    stock_on_hand: running.quantity,
                    asset_value: running.value,
                }
            })
            .collect();

        let closing = details
            .last()
            .map(|d| Balance::new(d.stock_on_hand, d.asset_value))
            .unwrap_or(opening);

        Self {
            from,
            to,
            opening,
            opening_source,
            closing,
            details,
        }
    }
}

/// One line of the point-in-time closing report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingRow {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub product_name: Option<String>,
    pub unit: Option<String>,
    pub closing_quantity: Decimal,
    pub closing_value: Decimal,
    pub unit_cost: Decimal,
}

impl ClosingRow {
    fn empty(warehouse_id: WarehouseId, product_id: ProductId, product_kind: ProductKind) -> Self {
        Self {
            warehouse_id,
            product_id,
            product_kind,
            product_name: None,
            unit: None,
            closing_quantity: Decimal::ZERO,
            closing_value: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
        }
    }

    fn finish(mut self, products: &[ProductInfo]) -> Self {
        if let Some(info) = products
            .iter()
            .find(|p| p.product_id == self.product_id && p.product_kind == self.product_kind)
        {
            self.product_name = Some(info.name.clone());
            self.unit = Some(info.unit.clone());
        }
        if !self.closing_quantity.is_zero() {
            self.unit_cost = self.closing_value / self.closing_quantity;
        }
        self
    }
}

/// Sum the latest row per partition into one row per (product, kind).
pub fn closing_rows(
    warehouse_id: WarehouseId,
    latest_per_partition: &[LedgerEntry],
    products: &[ProductInfo],
) -> Vec<ClosingRow> {
    let mut grouped: BTreeMap<(ProductId, ProductKind), ClosingRow> = BTreeMap::new();
    for row in latest_per_partition {
        let entry = grouped
            .entry((row.product_id, row.product_kind))
            .or_insert_with(|| ClosingRow::empty(warehouse_id, row.product_id, row.product_kind));
        entry.closing_quantity += row.balance.closing_quantity;
        entry.closing_value += row.balance.closing_asset_value;
    }
    grouped.into_values().map(|row| row.finish(products)).collect()
}

/// Closing rows from the current-quantity snapshot. Cost fields stay zero.
pub fn closing_rows_from_snapshot(
    warehouse_id: WarehouseId,
    snapshot: &[QuantitySnapshot],
    products: &[ProductInfo],
) -> Vec<ClosingRow> {
    let mut grouped: BTreeMap<(ProductId, ProductKind), ClosingRow> = BTreeMap::new();
    for row in snapshot {
        grouped
            .entry((row.product_id, row.product_kind))
            .or_insert_with(|| ClosingRow::empty(warehouse_id, row.product_id, row.product_kind))
            .closing_quantity += row.current_quantity;
    }
    grouped
        .into_values()
        .map(|row| {
            let mut row = row.finish(products);
            row.unit_cost = Decimal::ZERO;
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ReferenceType, RunningBalance};
    use crate::rebuild::RebuildPlan;
    use crate::test_support::{PartitionBuilder, date};
    use rust_decimal_macros::dec;

    /// Builder rows with derived fields filled in by a full walk.
    fn rebuilt(p: &PartitionBuilder) -> Vec<LedgerEntry> {
        let mut rows = p.ordered();
        let plan = RebuildPlan::new(rows[0].partition_key(), date(12, 1), None, rows.clone()).unwrap();
        for (row, update) in rows.iter_mut().zip(plan.walk()) {
            row.balance = update.balance;
        }
        rows
    }

    fn opening_row(p: &PartitionBuilder, quantity: Decimal, unit_cost: Decimal) -> OpeningStock {
        let t = p.ordered().remove(0);
        OpeningStock {
            tenant_id: t.tenant_id,
            product_id: t.product_id,
            product_kind: t.product_kind,
            warehouse_id: t.warehouse_id,
            batch_number: None,
            quantity,
            unit_cost,
        }
    }

    #[test]
    fn ledger_tier_wins_even_when_zero() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(10));
        p.push(ReferenceType::Invoice, date(1, 2), dec!(-1), dec!(10));
        let rows = rebuilt(&p);
        let table = [opening_row(&p, dec!(9), dec!(9))];

        let (balance, source) = resolve_opening(date(1, 5), &rows[1..], &[], &table);
        assert_eq!(source, OpeningSource::Ledger);
        assert!(balance.is_zero());
    }

    #[test]
    fn opening_postings_used_when_ledger_is_empty_before_window() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::OpeningStock, date(1, 1), dec!(3), dec!(5));
        p.push(ReferenceType::Bill, date(1, 1), dec!(2), dec!(7));
        let rows = rebuilt(&p);
        let table = [opening_row(&p, dec!(100), dec!(1))];

        let (balance, source) = resolve_opening(date(1, 1), &[], &rows, &table);
        assert_eq!(source, OpeningSource::OpeningPostings);
        assert_eq!(balance, Balance::new(dec!(3), dec!(15)));
    }

    #[test]
    fn zero_postings_fall_through_to_source_table_without_summing() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::OpeningStock, date(1, 1), dec!(0), dec!(5));
        let rows = rebuilt(&p);
        let table = [opening_row(&p, dec!(4), dec!(2.5))];

        let (balance, source) = resolve_opening(date(1, 1), &[], &rows, &table);
        assert_eq!(source, OpeningSource::OpeningStockTable);
        assert_eq!(balance, Balance::new(dec!(4), dec!(10)));
    }

    #[test]
    fn nothing_anywhere_is_empty() {
        let (balance, source) = resolve_opening(date(1, 1), &[], &[], &[]);
        assert_eq!(source, OpeningSource::Empty);
        assert!(balance.is_zero());
    }

    #[test]
    fn opening_postings_are_not_double_counted_in_details() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::OpeningStock, date(1, 1), dec!(3), dec!(5));
        p.push(ReferenceType::Invoice, date(1, 4), dec!(-1), dec!(5));
        let rows = rebuilt(&p);

        let (opening, source) = resolve_opening(date(1, 1), &[], &rows, &[]);
        let snap = ValuationSnapshot::compute(date(1, 1), date(1, 31), opening, source, rows);
        assert_eq!(snap.details.len(), 1);
        assert_eq!(snap.details[0].stock_on_hand, dec!(2));
        assert_eq!(snap.closing, Balance::new(dec!(2), dec!(10)));
    }

    #[test]
    fn closing_falls_back_to_opening_without_details() {
        let snap = ValuationSnapshot::compute(
            date(1, 1),
            date(1, 31),
            Balance::new(dec!(2), dec!(20)),
            OpeningSource::Ledger,
            vec![],
        );
        assert_eq!(snap.closing, snap.opening);
    }

    #[test]
    fn backdated_scenario_valuation_closes_at_zero() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::OpeningStock, date(12, 31), dec!(1), dec!(1700));
        p.push(ReferenceType::Bill, date(1, 3), dec!(2), dec!(1800));
        p.push(ReferenceType::Invoice, date(1, 8), dec!(-2), dec!(1800));
        p.push(ReferenceType::InventoryAdjustment, date(1, 5), dec!(-1), dec!(1700));
        let rows = rebuilt(&p);

        let (opening, source) = resolve_opening(date(12, 31), &[], &rows, &[]);
        assert_eq!(source, OpeningSource::OpeningPostings);
        let snap = ValuationSnapshot::compute(date(12, 31), date(1, 31), opening, source, rows);
        assert_eq!(snap.details.len(), 3);
        assert_eq!(snap.closing, Balance::default());
    }

    #[test]
    fn closing_rows_sum_batches_and_join_product_info() {
        let mut a = PartitionBuilder::new();
        a.push(ReferenceType::Bill, date(1, 1), dec!(2), dec!(10));
        let mut rows = rebuilt(&a);
        let mut other_batch = rows[0].clone();
        other_batch.batch_number = Some("B2".into());
        other_batch.balance = RunningBalance::default().advance(dec!(3), dec!(20), false);
        rows.push(other_batch);

        let info = ProductInfo {
            tenant_id: rows[0].tenant_id,
            product_id: rows[0].product_id,
            product_kind: rows[0].product_kind,
            name: "Widget".into(),
            unit: "pcs".into(),
        };
        let out = closing_rows(rows[0].warehouse_id, &rows, &[info]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].closing_quantity, dec!(5));
        assert_eq!(out[0].closing_value, dec!(80));
        assert_eq!(out[0].unit_cost, dec!(16));
        assert_eq!(out[0].product_name.as_deref(), Some("Widget"));
    }

    #[test]
    fn snapshot_fallback_reports_zero_cost() {
        let p = {
            let mut p = PartitionBuilder::new();
            p.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(1));
            p
        };
        let t = p.ordered().remove(0);
        let snap = [QuantitySnapshot {
            tenant_id: t.tenant_id,
            product_id: t.product_id,
            product_kind: t.product_kind,
            warehouse_id: t.warehouse_id,
            batch_number: None,
            current_quantity: dec!(7),
        }];
        let out = closing_rows_from_snapshot(t.warehouse_id, &snap, &[]);
        assert_eq!(out[0].closing_quantity, dec!(7));
        assert_eq!(out[0].closing_value, Decimal::ZERO);
        assert_eq!(out[0].unit_cost, Decimal::ZERO);
    }
}
