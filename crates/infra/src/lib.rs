//! Infrastructure layer: storage backends, the rebuild and valuation engines,
//! outbox processing, workflows and configuration.

pub mod config;
pub mod outbox;
pub mod rebuild;
pub mod store;
pub mod valuation;
pub mod workflow;

mod integration_tests;

pub use config::{ConfigError, StockbookConfig};
pub use rebuild::{RebuildError, RebuildReport, rebuild_affected, rebuild_partition};
pub use store::{Database, InMemoryDatabase, PostgresDatabase, StoreError, Transaction};
pub use valuation::{ClosingQuery, ValuationQuery, get_closing_snapshot, get_valuation};
pub use workflow::{StockMovementWorkflow, Workflow, WorkflowError, WorkflowRegistry};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use stockbook_core::{DocumentId, ProductId, TenantId, WarehouseId};
    use stockbook_inventory::{
        LedgerEntry, NewLedgerEntry, PartitionKey, ProductInfo, ProductKind, Reference, ReferenceType, Relation,
    };

    use crate::store::{InMemoryDatabase, Transaction};

    /// December dates fall in 2023, everything else in 2024.
    pub fn date(month: u32, day: u32) -> NaiveDate {
        let year = if month == 12 { 2023 } else { 2024 };
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// One tenant, warehouse and single product.
    #[derive(Debug, Clone, Copy)]
    pub struct Fixture {
        pub tenant_id: TenantId,
        pub warehouse_id: WarehouseId,
        pub product_id: ProductId,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                tenant_id: TenantId::new(),
                warehouse_id: WarehouseId::new(),
                product_id: ProductId::new(),
            }
        }

        pub fn key(&self) -> PartitionKey {
            PartitionKey {
                tenant_id: self.tenant_id,
                warehouse_id: self.warehouse_id,
                product_id: self.product_id,
                product_kind: ProductKind::Single,
                batch_number: None,
            }
        }

        pub fn product(&self) -> ProductInfo {
            ProductInfo {
                tenant_id: self.tenant_id,
                product_id: self.product_id,
                product_kind: ProductKind::Single,
                name: "Steel rod".into(),
                unit: "pcs".into(),
            }
        }

        /// Database with this fixture's product and warehouse in the catalogue.
        pub async fn seeded_database(&self) -> InMemoryDatabase {
            let db = InMemoryDatabase::new();
            db.insert_product(self.product()).await;
            db.insert_warehouse(self.tenant_id, self.warehouse_id).await;
            db
        }

        pub async fn append(
            &self,
            tx: &mut dyn Transaction,
            reference_type: ReferenceType,
            on: NaiveDate,
            quantity: Decimal,
            unit_cost: Decimal,
        ) -> LedgerEntry {
            let entry = NewLedgerEntry {
                tenant_id: self.tenant_id,
                warehouse_id: self.warehouse_id,
                product_id: self.product_id,
                product_kind: ProductKind::Single,
                batch_number: None,
                transaction_date: on,
                quantity,
                base_unit_cost: unit_cost,
                description: String::new(),
                reference: Reference::new(reference_type, DocumentId::new()),
                is_outgoing: false,
                is_transfer_in: false,
                relation: Relation::Original,
            };
            tx.append_entry(entry, Utc::now()).await.unwrap()
        }
    }
}
