//! Anchor-plus-forward-walk recomputation of a partition's running balances.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::LedgerEntryId;

use crate::entry::{LedgerEntry, PartitionKey, RunningBalance};
use crate::error::LedgerError;
use crate::fifo::Repriced;

/// New derived values for one row, written back by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedUpdate {
    pub id: LedgerEntryId,
    pub base_unit_cost: Decimal,
    pub balance: RunningBalance,
}

/// Working set of one partition rebuild.
#[derive(Debug, Clone)]
pub struct RebuildPlan {
    partition: PartitionKey,
    from: NaiveDate,
    anchor: RunningBalance,
    rows: Vec<LedgerEntry>,
}

impl RebuildPlan {
    /// Validate a working set.
    ///
    /// `anchor` is the last row strictly before `from`, or `None` when the
    /// window starts the partition. `rows` are all rows dated `from` onward in
    /// partition order.
    pub fn new(
        partition: PartitionKey,
        from: NaiveDate,
        anchor: Option<&LedgerEntry>,
        rows: Vec<LedgerEntry>,
    ) -> Result<Self, LedgerError> {
        let mut anchor_balance = RunningBalance::default();
        if let Some(anchor) = anchor {
            if anchor.transaction_date >= from {
                return Err(LedgerError::AnchorInsideWindow { anchor: anchor.id });
            }
            Self::check_partition(&partition, anchor)?;
            anchor_balance = anchor.balance;
        }

        for row in &rows {
            Self::check_partition(&partition, row)?;
            if row.transaction_date < from {
                return Err(LedgerError::Unordered(row.id));
            }
        }
        if let Some(pair) = rows.windows(2).find(|w| w[0].order_key() >= w[1].order_key()) {
            return Err(LedgerError::Unordered(pair[1].id));
        }

        Ok(Self {
            partition,
            from,
            anchor: anchor_balance,
            rows,
        })
    }

    fn check_partition(partition: &PartitionKey, row: &LedgerEntry) -> Result<(), LedgerError> {
        if &row.partition_key() != partition {
            return Err(LedgerError::ForeignPartition {
                entry: row.id,
                partition: partition.clone(),
            });
        }
        Ok(())
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn rows(&self) -> &[LedgerEntry] {
        &self.rows
    }

    /// Whether any row in the window needs FIFO layers to be priced.
    pub fn needs_layers(&self) -> bool {
        self.rows.iter().any(LedgerEntry::is_fifo_priced)
    }

    /// Apply repriced unit costs to rows in the window.
    pub fn apply(&mut self, repriced: &[Repriced]) {
        for change in repriced {
            if let Some(row) = self.rows.iter_mut().find(|r| r.id == change.id) {
                row.base_unit_cost = change.new_unit_cost;
            }
        }
    }

    /// Walk the window from the anchor, producing one update per row.
    pub fn walk(&self) -> Vec<DerivedUpdate> {
        let mut running = self.anchor;
        self.rows
            .iter()
            .map(|row| {
                running = running.advance(row.quantity, row.base_unit_cost, row.is_outgoing);
                DerivedUpdate {
                    id: row.id,
                    base_unit_cost: row.base_unit_cost,
                    balance: running,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ReferenceType;
    use crate::fifo::reprice;
    use crate::test_support::{PartitionBuilder, date};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    /// Full rebuild of a builder's rows from the start of history.
    fn rebuild_all(p: &PartitionBuilder) -> Vec<DerivedUpdate> {
        let rows = p.ordered();
        let key = rows[0].partition_key();
        let mut plan = RebuildPlan::new(key, date(12, 1), None, rows.clone()).unwrap();
        plan.apply(&reprice(&rows, date(12, 1)));
        plan.walk()
    }

    #[test]
    fn backdated_adjustment_scenario_closes_at_zero() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::OpeningStock, date(12, 31), dec!(1), dec!(1700));
        p.push(ReferenceType::Bill, date(1, 3), dec!(2), dec!(1800));
        let invoice = p.push(ReferenceType::Invoice, date(1, 8), dec!(-2), dec!(1750));
        p.push(ReferenceType::InventoryAdjustment, date(1, 5), dec!(-1), dec!(1700));

        let updates = rebuild_all(&p);
        let last = updates.last().unwrap();
        assert_eq!(last.id, invoice);
        assert_eq!(last.base_unit_cost, dec!(1800));
        assert_eq!(last.balance.closing_quantity, dec!(0));
        assert_eq!(last.balance.closing_asset_value, dec!(0));
        assert_eq!(last.balance.cumulative_incoming, dec!(3));
        assert_eq!(last.balance.cumulative_outgoing, dec!(3));
        assert_eq!(
            updates.iter().map(|u| u.balance.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn walk_continues_from_anchor() {
        let mut p = PartitionBuilder::new();
        let first = p.push(ReferenceType::Bill, date(1, 1), dec!(4), dec!(10));
        p.push(ReferenceType::Bill, date(1, 2), dec!(1), dec!(20));
        let rows = p.ordered();

        let mut anchor = rows[0].clone();
        anchor.balance = RunningBalance::default().advance(dec!(4), dec!(10), false);
        assert_eq!(anchor.id, first);

        let plan =
            RebuildPlan::new(anchor.partition_key(), date(1, 2), Some(&anchor), rows[1..].to_vec()).unwrap();
        let updates = plan.walk();
        assert_eq!(updates[0].balance.closing_quantity, dec!(5));
        assert_eq!(updates[0].balance.closing_asset_value, dec!(60));
        assert_eq!(updates[0].balance.sequence, 2);
    }

    #[test]
    fn anchor_inside_window_is_rejected() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::Bill, date(1, 2), dec!(1), dec!(1));
        let rows = p.ordered();
        let err = RebuildPlan::new(rows[0].partition_key(), date(1, 2), Some(&rows[0]), vec![]).unwrap_err();
        assert_eq!(err, LedgerError::AnchorInsideWindow { anchor: rows[0].id });
    }

    #[test]
    fn unordered_rows_are_rejected() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(1));
        p.push(ReferenceType::Bill, date(1, 2), dec!(1), dec!(1));
        let mut rows = p.ordered();
        rows.reverse();
        let key = rows[0].partition_key();
        assert!(matches!(
            RebuildPlan::new(key, date(1, 1), None, rows),
            Err(LedgerError::Unordered(_))
        ));
    }

    #[test]
    fn rows_from_another_partition_are_rejected() {
        let mut a = PartitionBuilder::new();
        a.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(1));
        let mut b = PartitionBuilder::new();
        b.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(1));

        let key = a.ordered()[0].partition_key();
        assert!(matches!(
            RebuildPlan::new(key, date(1, 1), None, b.ordered()),
            Err(LedgerError::ForeignPartition { .. })
        ));
    }

    #[test]
    fn incoming_sorts_before_outgoing_on_the_same_day() {
        let mut p = PartitionBuilder::new();
        let out = p.push(ReferenceType::InventoryAdjustment, date(1, 1), dec!(-1), dec!(5));
        let inc = p.push(ReferenceType::Bill, date(1, 1), dec!(1), dec!(5));
        let ids: Vec<_> = p.ordered().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![inc, out]);
    }

    proptest! {
        #[test]
        fn sequence_is_dense_and_closing_equals_sum(
            moves in prop::collection::vec((1u32..28, -50i64..50, 1i64..500), 1..40)
        ) {
            let mut p = PartitionBuilder::new();
            for (day, qty, cost) in &moves {
                p.push(ReferenceType::InventoryAdjustment, date(1, *day), Decimal::from(*qty), Decimal::from(*cost));
            }
            let rows = p.ordered();
            let plan = RebuildPlan::new(rows[0].partition_key(), date(1, 1), None, rows.clone()).unwrap();
            let updates = plan.walk();

            for (i, u) in updates.iter().enumerate() {
                prop_assert_eq!(u.balance.sequence, i as i64 + 1);
            }
            let qty: Decimal = rows.iter().map(|r| r.quantity).sum();
            let value: Decimal = rows.iter().map(|r| r.movement_value()).sum();
            let last = updates.last().unwrap().balance;
            prop_assert_eq!(last.closing_quantity, qty);
            prop_assert_eq!(last.closing_asset_value, value);
        }
    }
}
