//! Outbox domain.
//!
//! The durable outbox row, its two independent lifecycles (publish and
//! processing), the retry policy that schedules re-attempts, the stable
//! status view derived from raw rows, and the decoded event handed to
//! workflows. No IO lives here.

pub mod bus;
pub mod decoded;
pub mod outbox;
pub mod retry;
pub mod status;

pub use bus::{InMemoryPublisher, PublishError, Publisher, Subscription};
pub use decoded::{DecodeError, DecodedEvent, DocumentLine, DocumentPayload};
pub use outbox::{Action, Lease, OutboxEvent, OutboxEventId, ProcessingState, ProcessingStatus, PublishState, PublishStatus};
pub use retry::{Backoff, RetryPolicy};
pub use status::{OutboxState, OutboxStatus};
