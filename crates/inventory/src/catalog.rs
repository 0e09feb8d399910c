//! Read-only collaborator data the ledger joins against.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{ProductId, TenantId, WarehouseId};

use crate::entry::ProductKind;

/// Catalogue metadata for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub name: String,
    pub unit: String,
}

/// Row of the one-time opening-stock source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningStock {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub warehouse_id: WarehouseId,
    pub batch_number: Option<String>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

impl OpeningStock {
    pub fn value(&self) -> Decimal {
        self.quantity * self.unit_cost
    }
}

/// Row of the materialised current-quantity snapshot table. Carries no cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitySnapshot {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub warehouse_id: WarehouseId,
    pub batch_number: Option<String>,
    pub current_quantity: Decimal,
}
