//! Typed query for document numbers.
//!
//! Each reference type names its document table through a static
//! [`DocumentSource`]; the query is assembled only from those declared
//! fragments, with every runtime value bound as a parameter.

use std::collections::BTreeMap;

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use stockbook_core::{DocumentId, StringEnum, TenantId};
use stockbook_inventory::ReferenceType;

/// Table and number column holding one reference type's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentSource {
    pub table: &'static str,
    pub number_column: &'static str,
}

impl DocumentSource {
    /// `None` for reference types without a numbered document.
    pub fn of(reference_type: ReferenceType) -> Option<Self> {
        let (table, number_column) = match reference_type {
            ReferenceType::OpeningStock => return None,
            ReferenceType::Bill => ("bills", "bill_number"),
            ReferenceType::SupplierCredit => ("supplier_credits", "supplier_credit_number"),
            ReferenceType::Invoice => ("invoices", "invoice_number"),
            ReferenceType::CreditNote => ("credit_notes", "credit_note_number"),
            ReferenceType::InventoryAdjustment => ("inventory_adjustments", "adjustment_number"),
            ReferenceType::TransferOrder => ("transfer_orders", "order_number"),
        };
        Some(Self { table, number_column })
    }
}

/// Document-number lookup for a set of references.
#[derive(Debug, Clone)]
pub struct DocumentNumberQuery {
    tenant_id: TenantId,
    ids: BTreeMap<ReferenceType, Vec<Uuid>>,
}

impl DocumentNumberQuery {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ids: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, reference_type: ReferenceType, reference_id: DocumentId) {
        if DocumentSource::of(reference_type).is_none() {
            return;
        }
        let ids = self.ids.entry(reference_type).or_default();
        let id = *reference_id.as_uuid();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `UNION ALL` of one branch per requested reference type, yielding
    /// `(reference_type, reference_id, reference_number)`.
    pub fn build(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("");
        let mut first = true;
        for (reference_type, ids) in &self.ids {
            let Some(source) = DocumentSource::of(*reference_type) else {
                continue;
            };
            if !first {
                qb.push(" UNION ALL ");
            }
            first = false;
            qb.push("SELECT ")
                .push_bind(reference_type.as_str())
                .push("::text AS reference_type, id AS reference_id, ")
                .push(source.number_column)
                .push(" AS reference_number FROM ")
                .push(source.table)
                .push(" WHERE tenant_id = ")
                .push_bind(*self.tenant_id.as_uuid())
                .push(" AND id = ANY(")
                .push_bind(ids.clone())
                .push(")");
        }
        qb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_numbered_type_has_a_fragment() {
        for rt in ReferenceType::ALL {
            assert_eq!(DocumentSource::of(rt).is_none(), rt == ReferenceType::OpeningStock);
        }
    }

    #[test]
    fn builds_one_branch_per_type() {
        let mut q = DocumentNumberQuery::new(TenantId::new());
        q.add(ReferenceType::Invoice, DocumentId::new());
        q.add(ReferenceType::Invoice, DocumentId::new());
        q.add(ReferenceType::Bill, DocumentId::new());
        q.add(ReferenceType::OpeningStock, DocumentId::new());

        let qb = q.build();
        let sql = qb.sql();
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert!(sql.contains("FROM bills"));
        assert!(sql.contains("invoice_number AS reference_number FROM invoices"));
        assert!(!sql.contains("product_opening_stocks"));
    }

    #[test]
    fn opening_stock_only_is_empty() {
        let mut q = DocumentNumberQuery::new(TenantId::new());
        q.add(ReferenceType::OpeningStock, DocumentId::new());
        assert!(q.is_empty());
    }
}
