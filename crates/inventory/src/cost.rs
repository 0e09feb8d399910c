//! Cost-of-goods postings that follow a document's ledger cost.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{DocumentId, TenantId, string_enum};

use crate::entry::{LedgerEntry, ReferenceType};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PostingAccount {
    Inventory,
    CostOfGoodsSold,
}

string_enum!(
    PostingAccount,
    "posting account",
    [
        (PostingAccount::Inventory, "inventory"),
        (PostingAccount::CostOfGoodsSold, "cost_of_goods_sold"),
        (PostingAccount::CostOfGoodsSold, "cogs"),
    ]
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingLine {
    pub account: PostingAccount,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// The cost-of-goods figure of one document and its two posting lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostPosting {
    pub tenant_id: TenantId,
    pub reference_type: ReferenceType,
    pub reference_id: DocumentId,
    pub cost_of_goods: Decimal,
    pub lines: Vec<PostingLine>,
}

impl CostPosting {
    /// Recompute from the document's ledger rows. Only active outgoing rows count.
    pub fn from_entries(
        tenant_id: TenantId,
        reference_type: ReferenceType,
        reference_id: DocumentId,
        entries: &[LedgerEntry],
    ) -> Self {
        let cost_of_goods: Decimal = entries
            .iter()
            .filter(|e| {
                e.is_active()
                    && e.is_outgoing
                    && e.reference.reference_type == reference_type
                    && e.reference.reference_id == reference_id
            })
            .map(|e| e.quantity.abs() * e.base_unit_cost)
            .sum();

        Self {
            tenant_id,
            reference_type,
            reference_id,
            cost_of_goods,
            lines: vec![
                PostingLine {
                    account: PostingAccount::CostOfGoodsSold,
                    debit: cost_of_goods,
                    credit: Decimal::ZERO,
                },
                PostingLine {
                    account: PostingAccount::Inventory,
                    debit: Decimal::ZERO,
                    credit: cost_of_goods,
                },
            ],
        }
    }

    pub fn is_balanced(&self) -> bool {
        let debit: Decimal = self.lines.iter().map(|l| l.debit).sum();
        let credit: Decimal = self.lines.iter().map(|l| l.credit).sum();
        debit == credit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PartitionBuilder, date};
    use rust_decimal_macros::dec;

    #[test]
    fn posting_follows_active_outgoing_rows() {
        let mut p = PartitionBuilder::new();
        p.push(ReferenceType::Bill, date(1, 1), dec!(5), dec!(10));
        let first = p.push(ReferenceType::Invoice, date(1, 2), dec!(-2), dec!(10));
        let rows = p.ordered();
        let invoice = rows.iter().find(|r| r.id == first).unwrap().reference.clone();

        let posting = CostPosting::from_entries(rows[0].tenant_id, invoice.reference_type, invoice.reference_id, &rows);
        assert_eq!(posting.cost_of_goods, dec!(20));
        assert!(posting.is_balanced());
        assert_eq!(posting.lines[0].account, PostingAccount::CostOfGoodsSold);
        assert_eq!(posting.lines[0].debit, dec!(20));
        assert_eq!(posting.lines[1].credit, dec!(20));
    }

    #[test]
    fn reversed_rows_drop_out_of_the_posting() {
        let mut p = PartitionBuilder::new();
        let sold = p.push(ReferenceType::Invoice, date(1, 2), dec!(-2), dec!(10));
        p.row_mut(sold).reversed_by = Some(stockbook_core::LedgerEntryId(99));
        let rows = p.ordered();
        let r = &rows[0].reference;

        let posting = CostPosting::from_entries(rows[0].tenant_id, r.reference_type, r.reference_id, &rows);
        assert_eq!(posting.cost_of_goods, Decimal::ZERO);
    }
}
