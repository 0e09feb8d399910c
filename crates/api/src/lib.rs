//! Service surface: the operations exposed to the (external) transport layer.

pub mod context;
pub mod errors;
pub mod service;

pub use context::{TenantContext, require_tenant};
pub use errors::ApiError;
pub use service::{ClosingFilter, StockbookService};
