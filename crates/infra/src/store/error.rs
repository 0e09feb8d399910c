use thiserror::Error;

/// Storage failures, shared by every backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique violation, serialization failure, or a broken reversal link.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A persisted row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}
