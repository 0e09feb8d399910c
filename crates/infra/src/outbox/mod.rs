//! Outbox processing: the lease-and-apply processor, the publish relay and
//! the operator control surface.

pub mod control;
pub mod processor;
pub mod relay;

pub use control::{ControlError, enqueue_document_event, outbox_status, reprocess};
pub use processor::{BatchOutcome, OutboxProcessor, OutboxProcessorConfig, ProcessorError, ProcessorHandle, ProcessorStats};
pub use relay::{OutboxRelay, RelayOutcome};
