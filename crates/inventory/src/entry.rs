use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::{
    DocumentId, DocumentLineId, LedgerEntryId, ProductId, StringEnum, TenantId, WarehouseId,
    string_enum,
};

use crate::error::LedgerError;

/// Catalogue product kind. Part of the partition key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductKind {
    Single,
    Group,
    Composite,
    Variant,
    Input,
}

string_enum!(
    ProductKind,
    "product kind",
    [
        (ProductKind::Single, "single"),
        (ProductKind::Group, "group"),
        (ProductKind::Composite, "composite"),
        (ProductKind::Variant, "variant"),
        (ProductKind::Input, "input"),
        (ProductKind::Single, "S"),
        (ProductKind::Group, "G"),
        (ProductKind::Composite, "C"),
        (ProductKind::Variant, "V"),
        (ProductKind::Input, "I"),
    ]
);

/// How an outgoing movement gets its per-unit cost.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CostBasis {
    /// The document states the cost; the ledger never changes it.
    Declared,
    /// Cost is taken from the oldest incoming layers still on hand and is
    /// recomputed whenever earlier history changes.
    Fifo,
}

/// Business document type that produced a ledger row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceType {
    OpeningStock,
    Bill,
    SupplierCredit,
    Invoice,
    CreditNote,
    InventoryAdjustment,
    TransferOrder,
}

string_enum!(
    ReferenceType,
    "reference type",
    [
        (ReferenceType::OpeningStock, "ProductOpeningStock"),
        (ReferenceType::Bill, "Bill"),
        (ReferenceType::SupplierCredit, "SupplierCredit"),
        (ReferenceType::Invoice, "Invoice"),
        (ReferenceType::CreditNote, "CreditNote"),
        (ReferenceType::InventoryAdjustment, "InventoryAdjustment"),
        (ReferenceType::TransferOrder, "TransferOrder"),
        (ReferenceType::OpeningStock, "OpeningStock"),
    ]
);

impl ReferenceType {
    pub const ALL: [ReferenceType; 7] = [
        ReferenceType::OpeningStock,
        ReferenceType::Bill,
        ReferenceType::SupplierCredit,
        ReferenceType::Invoice,
        ReferenceType::CreditNote,
        ReferenceType::InventoryAdjustment,
        ReferenceType::TransferOrder,
    ];

    /// Cost basis used for this document's outgoing lines.
    pub fn cost_basis(self) -> CostBasis {
        match self {
            ReferenceType::Invoice | ReferenceType::SupplierCredit | ReferenceType::TransferOrder => {
                CostBasis::Fifo
            }
            _ => CostBasis::Declared,
        }
    }

    /// Whether the document carries a cost-of-goods posting that must follow
    /// the ledger cost of its rows.
    pub fn posts_cost_of_goods(self) -> bool {
        matches!(self, ReferenceType::Invoice)
    }
}

/// Link from a ledger row to the document line that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub reference_type: ReferenceType,
    pub reference_id: DocumentId,
    pub line_id: Option<DocumentLineId>,
}

impl Reference {
    pub fn new(reference_type: ReferenceType, reference_id: DocumentId) -> Self {
        Self {
            reference_type,
            reference_id,
            line_id: None,
        }
    }

    pub fn with_line(mut self, line_id: DocumentLineId) -> Self {
        self.line_id = Some(line_id);
        self
    }

    pub fn is_opening_stock(&self) -> bool {
        self.reference_type == ReferenceType::OpeningStock
    }
}

/// Whether a row is an original movement or the reversal of another row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    Original,
    Reversal { of: LedgerEntryId, reason: String },
}

impl Relation {
    pub fn reverses(&self) -> Option<LedgerEntryId> {
        match self {
            Relation::Original => None,
            Relation::Reversal { of, .. } => Some(*of),
        }
    }
}

/// Ledger partition: rows sharing a key have one running balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub batch_number: Option<String>,
}

impl core::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}/{}",
            self.tenant_id,
            self.warehouse_id,
            self.product_id,
            self.product_kind.as_str(),
            self.batch_number.as_deref().unwrap_or("-")
        )
    }
}

/// Derived running fields of a ledger row. Only the rebuild rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunningBalance {
    pub closing_quantity: Decimal,
    pub closing_asset_value: Decimal,
    pub cumulative_incoming: Decimal,
    pub cumulative_outgoing: Decimal,
    /// Dense 1..N position in the partition total order; 0 means "not yet rebuilt".
    pub sequence: i64,
}

impl RunningBalance {
    /// Carry this balance forward over one signed movement.
    pub fn advance(&self, quantity: Decimal, unit_cost: Decimal, is_outgoing: bool) -> Self {
        let mut next = *self;
        next.closing_quantity += quantity;
        next.closing_asset_value += quantity * unit_cost;
        if is_outgoing {
            next.cumulative_outgoing += quantity.abs();
        } else {
            next.cumulative_incoming += quantity;
        }
        next.sequence += 1;
        next
    }
}

/// A ledger row as written by a workflow, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub batch_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub quantity: Decimal,
    pub base_unit_cost: Decimal,
    pub description: String,
    pub reference: Reference,
    pub is_outgoing: bool,
    pub is_transfer_in: bool,
    pub relation: Relation,
}

impl NewLedgerEntry {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            tenant_id: self.tenant_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            product_kind: self.product_kind,
            batch_number: self.batch_number.clone(),
        }
    }

    /// Enforce the outgoing-sign invariant.
    ///
    /// For a non-zero quantity `is_outgoing` is derived from the sign and any
    /// caller-supplied flag is overwritten. Zero quantities keep the flag.
    pub fn normalized(mut self) -> Self {
        if !self.quantity.is_zero() {
            self.is_outgoing = self.quantity.is_sign_negative();
        }
        self
    }

    /// Build the reversal of a persisted row.
    ///
    /// The reversal sits in the same partition, on the same date, with the
    /// opposite quantity at the same unit cost, so the pair nets to zero.
    pub fn reversal_of(
        original: &LedgerEntry,
        reason: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        if original.reversed_by.is_some() {
            return Err(LedgerError::AlreadyReversed(original.id));
        }
        if let Relation::Reversal { .. } = original.relation {
            return Err(LedgerError::ReversalOfReversal(original.id));
        }

        Ok(Self {
            tenant_id: original.tenant_id,
            warehouse_id: original.warehouse_id,
            product_id: original.product_id,
            product_kind: original.product_kind,
            batch_number: original.batch_number.clone(),
            transaction_date: original.transaction_date,
            quantity: -original.quantity,
            base_unit_cost: original.base_unit_cost,
            description: format!("reversal of #{}", original.id),
            reference: original.reference.clone(),
            is_outgoing: !original.is_outgoing,
            is_transfer_in: false,
            relation: Relation::Reversal {
                of: original.id,
                reason: reason.into(),
            },
        }
        .normalized())
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub product_kind: ProductKind,
    pub batch_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub quantity: Decimal,
    pub base_unit_cost: Decimal,
    pub description: String,
    pub reference: Reference,
    pub is_outgoing: bool,
    pub is_transfer_in: bool,
    pub relation: Relation,
    /// Back-reference maintained by the store when a reversal is appended.
    pub reversed_by: Option<LedgerEntryId>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub balance: RunningBalance,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Materialise a new row with a store-assigned id and zeroed derived fields.
    pub fn from_new(id: LedgerEntryId, new: NewLedgerEntry, created_at: DateTime<Utc>) -> Self {
        let new = new.normalized();
        Self {
            id,
            tenant_id: new.tenant_id,
            warehouse_id: new.warehouse_id,
            product_id: new.product_id,
            product_kind: new.product_kind,
            batch_number: new.batch_number,
            transaction_date: new.transaction_date,
            quantity: new.quantity,
            base_unit_cost: new.base_unit_cost,
            description: new.description,
            reference: new.reference,
            is_outgoing: new.is_outgoing,
            is_transfer_in: new.is_transfer_in,
            relation: new.relation,
            reversed_by: None,
            reversed_at: None,
            balance: RunningBalance::default(),
            created_at,
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            tenant_id: self.tenant_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            product_kind: self.product_kind,
            batch_number: self.batch_number.clone(),
        }
    }

    /// Position in the partition total order: date, incoming before outgoing, row id.
    pub fn order_key(&self) -> (NaiveDate, bool, LedgerEntryId) {
        (self.transaction_date, self.is_outgoing, self.id)
    }

    /// Signed `quantity × base_unit_cost`.
    pub fn movement_value(&self) -> Decimal {
        self.quantity * self.base_unit_cost
    }

    /// Neither reversed nor itself a reversal.
    pub fn is_active(&self) -> bool {
        self.reversed_by.is_none() && matches!(self.relation, Relation::Original)
    }

    /// Whether the rebuild recomputes this row's unit cost from FIFO layers.
    pub fn is_fifo_priced(&self) -> bool {
        self.is_outgoing
            && self.is_active()
            && !self.is_transfer_in
            && self.reference.reference_type.cost_basis() == CostBasis::Fifo
    }
}
