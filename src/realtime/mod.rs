//! Realtime event publication.
//!
//! State changes stage [`EventEnvelope`]s into the store's outbox inside
//! the same transaction as the change itself; the [`OutboxPublisher`]
//! drains committed rows to the broker in per-stream sequence order. An
//! envelope for a rolled-back transaction can therefore never reach a
//! subscriber.

mod envelope;
mod publisher;

pub use envelope::{
    CONTRACT_VERSION, EventEnvelope, StagedEvent, event_type, idempotency_key, room_node,
    room_run, room_thread, stream_node, stream_run, stream_thread,
};
pub use publisher::{EventBroker, EventSubscriber, InProcessBroker, OutboxPublisher, PublishError};
