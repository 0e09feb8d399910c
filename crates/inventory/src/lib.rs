//! Stock ledger domain.
//!
//! Business rules for the append-only inventory ledger, implemented purely as
//! deterministic domain logic (no IO, no storage): entry invariants, the
//! partition total order, FIFO repricing, the running-balance walk and the
//! valuation arithmetic used by reports.

pub mod catalog;
pub mod cost;
pub mod entry;
pub mod error;
pub mod fifo;
pub mod rebuild;
pub mod valuation;

pub use catalog::{OpeningStock, ProductInfo, QuantitySnapshot};
pub use cost::{CostPosting, PostingAccount, PostingLine};
pub use entry::{
    CostBasis, LedgerEntry, NewLedgerEntry, PartitionKey, ProductKind, Reference, ReferenceType,
    Relation, RunningBalance,
};
pub use error::LedgerError;
pub use fifo::Repriced;
pub use rebuild::{DerivedUpdate, RebuildPlan};
pub use valuation::{
    Balance, ClosingRow, OpeningSource, ValuationDetail, ValuationSnapshot,
};
