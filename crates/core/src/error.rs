//! Errors raised while turning raw values into domain primitives.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Parse and decode failures for ids and tagged values.
///
/// Storage backends map these to a corrupt-row error; they never reach
/// callers directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A tagged value did not match any entry of its mapping table.
    #[error("unknown {kind} value: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}
