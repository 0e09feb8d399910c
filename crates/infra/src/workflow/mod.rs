//! Per-document workflows invoked by the outbox processor.
//!
//! A workflow turns one decoded outbox event into ledger mutations inside the
//! processor's transaction. Redelivery is expected, so every workflow must
//! recognise work it has already applied.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use stockbook_events::{DecodeError, DecodedEvent};
use stockbook_inventory::{LedgerError, ReferenceType};

use crate::rebuild::RebuildError;
use crate::store::{StoreError, Transaction};

mod stock_movement;

pub use stock_movement::{StockMovementWorkflow, validate_document};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("rebuild failed: {0}")]
    Rebuild(#[from] RebuildError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no workflow registered for {0}")]
    NoWorkflow(ReferenceType),
}

impl WorkflowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[async_trait]
pub trait Workflow: Send + Sync {
    /// Apply `event` through `tx`. `span` is the processor's span for this event.
    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        span: &tracing::Span,
        event: &DecodedEvent,
    ) -> Result<(), WorkflowError>;
}

/// Workflows keyed by the document type they handle.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<ReferenceType, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document type handled by [`StockMovementWorkflow`].
    pub fn with_stock_movements() -> Self {
        let shared: Arc<dyn Workflow> = Arc::new(StockMovementWorkflow);
        let mut registry = Self::new();
        for reference_type in ReferenceType::ALL {
            registry.register(reference_type, shared.clone());
        }
        registry
    }

    pub fn register(&mut self, reference_type: ReferenceType, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(reference_type, workflow);
    }

    pub fn resolve(&self, reference_type: ReferenceType) -> Result<Arc<dyn Workflow>, WorkflowError> {
        self.workflows
            .get(&reference_type)
            .cloned()
            .ok_or(WorkflowError::NoWorkflow(reference_type))
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.workflows.keys().collect();
        types.sort();
        f.debug_struct("WorkflowRegistry").field("types", &types).finish()
    }
}
