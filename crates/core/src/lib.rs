//! Shared building blocks for the stock ledger: typed ids, the domain error and the string-enum codec.

pub mod codec;
pub mod error;
pub mod id;

pub use codec::StringEnum;
pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, DocumentLineId, LedgerEntryId, ProductId, TenantId, WarehouseId};
