//! Caller-facing error taxonomy.

use thiserror::Error;

use stockbook_infra::outbox::ControlError;
use stockbook_infra::{RebuildError, StoreError, WorkflowError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("rebuild failed: {0}")]
    RebuildFailed(String),

    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn missing_tenant() -> Self {
        Self::InvalidArgument("missing tenant context".to_string())
    }

    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "invalid_argument",
            ApiError::NotFound(_) => "not_found",
            ApiError::ValidationFailed(_) => "validation_failed",
            ApiError::RebuildFailed(_) => "rebuild_failed",
            ApiError::WorkflowFailed(_) => "workflow_failed",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            ControlError::Payload(e) => ApiError::InvalidArgument(e.to_string()),
            ControlError::Store(e) => e.into(),
        }
    }
}

impl From<RebuildError> for ApiError {
    fn from(err: RebuildError) -> Self {
        ApiError::RebuildFailed(err.to_string())
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Validation(msg) => ApiError::ValidationFailed(msg),
            WorkflowError::Rebuild(e) => e.into(),
            WorkflowError::Store(e) => e.into(),
            other => ApiError::WorkflowFailed(other.to_string()),
        }
    }
}
