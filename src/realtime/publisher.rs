//! Broker abstraction and outbox drain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use super::envelope::EventEnvelope;
use crate::errors::StoreError;
use crate::store::Store;

/// Broker publication failures.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fan-out sink for committed envelopes.
pub trait EventBroker: Send + Sync {
    /// Publish one envelope. Per-stream ordering is the caller's duty.
    fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

/// In-process broker on a tokio broadcast channel.
///
/// Stands in for the shared broker; the publisher only sees the
/// [`EventBroker`] trait either way.
pub struct InProcessBroker {
    tx: broadcast::Sender<EventEnvelope>,
}

impl InProcessBroker {
    /// Broker with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the given rooms.
    pub fn subscribe(&self, rooms: impl IntoIterator<Item = String>) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            rooms: rooms.into_iter().collect(),
            last_delivered: HashMap::new(),
            rejected: 0,
        }
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBroker for InProcessBroker {
    fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        // A send error just means no subscriber is connected; envelopes are
        // not durable past the outbox and new subscribers tolerate gaps.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }
}

/// Room-scoped subscription with the monotonic-sequence contract applied.
pub struct EventSubscriber {
    rx: broadcast::Receiver<EventEnvelope>,
    rooms: HashSet<String>,
    last_delivered: HashMap<String, u64>,
    rejected: u64,
}

impl EventSubscriber {
    /// Receive the next envelope for this subscriber's rooms.
    ///
    /// Envelopes whose rooms do not intersect the subscription are skipped
    /// silently; envelopes whose sequence is not strictly greater than the
    /// last delivered on the same stream are rejected and counted.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            let envelope = match self.rx.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if !envelope.room_keys.iter().any(|k| self.rooms.contains(k)) {
                continue;
            }
            let last = self
                .last_delivered
                .get(&envelope.sequence_stream)
                .copied()
                .unwrap_or(0);
            if envelope.sequence <= last {
                self.rejected += 1;
                continue;
            }
            self.last_delivered
                .insert(envelope.sequence_stream.clone(), envelope.sequence);
            return Some(envelope);
        }
    }

    /// How many redelivered/stale envelopes were rejected.
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }
}

/// Drains committed outbox rows to the broker.
pub struct OutboxPublisher {
    store: Arc<Store>,
    broker: Arc<dyn EventBroker>,
}

impl OutboxPublisher {
    /// Publisher over the given store and broker.
    pub fn new(store: Arc<Store>, broker: Arc<dyn EventBroker>) -> Self {
        Self { store, broker }
    }

    /// Publish all unpublished envelopes in per-stream sequence order.
    ///
    /// Returns the number of envelopes published. Rows are only marked
    /// published after the broker accepted them, so a crashed drain
    /// redelivers - which the idempotency key makes safe.
    pub fn drain(&self) -> Result<usize, PublishError> {
        let pending = self.store.fetch_unpublished_events()?;
        let mut published = 0usize;
        for envelope in &pending {
            self.broker.publish(envelope)?;
            self.store.mark_event_published(&envelope.event_id)?;
            published += 1;
        }
        if published > 0 {
            debug!(count = published, "drained outbox");
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::envelope::CONTRACT_VERSION;
    use chrono::Utc;

    fn envelope(stream: &str, seq: u64, room: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("ev-{stream}-{seq}"),
            idempotency_key: format!("t:{stream}:{seq}"),
            sequence: seq,
            sequence_stream: stream.to_string(),
            emitted_at: Utc::now(),
            event_type: "flowchart:run:started".to_string(),
            entity_kind: "flowchart_run".to_string(),
            entity_id: "run-1".to_string(),
            room_keys: vec![room.to_string()],
            payload: serde_json::json!({}),
            contract_version: CONTRACT_VERSION.to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_room_scoped_envelopes() {
        let broker = InProcessBroker::default();
        let mut sub = broker.subscribe(["run:run-1".to_string()]);

        broker.publish(&envelope("run:run-1", 1, "run:run-1")).unwrap();
        broker.publish(&envelope("run:run-2", 1, "run:run-2")).unwrap();
        broker.publish(&envelope("run:run-1", 2, "run:run-1")).unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        // The run-2 envelope was filtered out by room.
        let second = sub.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.sequence_stream, "run:run-1");
    }

    #[tokio::test]
    async fn subscriber_rejects_non_monotonic_sequence() {
        let broker = InProcessBroker::default();
        let mut sub = broker.subscribe(["run:run-1".to_string()]);

        broker.publish(&envelope("run:run-1", 1, "run:run-1")).unwrap();
        broker.publish(&envelope("run:run-1", 1, "run:run-1")).unwrap(); // redelivery
        broker.publish(&envelope("run:run-1", 2, "run:run-1")).unwrap();

        assert_eq!(sub.recv().await.unwrap().sequence, 1);
        assert_eq!(sub.recv().await.unwrap().sequence, 2);
        assert_eq!(sub.rejected_count(), 1);
    }

    #[tokio::test]
    async fn late_subscriber_tolerates_gap_but_stays_monotonic() {
        let broker = InProcessBroker::default();
        // Published before anyone subscribed.
        broker.publish(&envelope("run:run-1", 1, "run:run-1")).unwrap();

        let mut sub = broker.subscribe(["run:run-1".to_string()]);
        broker.publish(&envelope("run:run-1", 5, "run:run-1")).unwrap();
        broker.publish(&envelope("run:run-1", 4, "run:run-1")).unwrap(); // stale
        broker.publish(&envelope("run:run-1", 6, "run:run-1")).unwrap();

        assert_eq!(sub.recv().await.unwrap().sequence, 5);
        assert_eq!(sub.recv().await.unwrap().sequence, 6);
        assert_eq!(sub.rejected_count(), 1);
    }
}
