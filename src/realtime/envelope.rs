//! Event envelope contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Realtime contract version stamped on every envelope.
pub const CONTRACT_VERSION: &str = "v1";

/// One published realtime message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this envelope.
    pub event_id: String,
    /// Deterministic key for subscriber-side deduplication.
    pub idempotency_key: String,
    /// Position within `sequence_stream`; strictly increasing.
    pub sequence: u64,
    /// Logical channel: `run:<id>`, `node:<id>`, or `thread:<id>`.
    pub sequence_stream: String,
    /// When the envelope was staged.
    pub emitted_at: DateTime<Utc>,
    /// `domain:entity:action`, e.g. `flowchart:node:succeeded`.
    pub event_type: String,
    /// Entity kind the envelope describes.
    pub entity_kind: String,
    /// Entity id the envelope describes.
    pub entity_id: String,
    /// Subscriber scopes; delivery requires a non-empty intersection.
    pub room_keys: Vec<String>,
    /// Event payload.
    pub payload: Value,
    /// Realtime contract version.
    pub contract_version: String,
}

/// An event before the store assigns its stream sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEvent {
    /// `domain:entity:action`.
    pub event_type: String,
    /// Entity kind the event describes.
    pub entity_kind: String,
    /// Entity id the event describes.
    pub entity_id: String,
    /// Stream the event is sequenced on.
    pub sequence_stream: String,
    /// Subscriber scopes.
    pub room_keys: Vec<String>,
    /// Event payload.
    pub payload: Value,
}

impl StagedEvent {
    /// Stage an event on the run stream, visible in the run room.
    pub fn on_run(
        run_id: &str,
        event_type: impl Into<String>,
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            sequence_stream: stream_run(run_id),
            room_keys: vec![room_run(run_id)],
            payload,
        }
    }

    /// Add an extra room key.
    pub fn also_in(mut self, room: String) -> Self {
        self.room_keys.push(room);
        self
    }
}

/// Deterministic idempotency key for an envelope. Redelivery with the same
/// key is a no-op at contract-following subscribers.
pub fn idempotency_key(event_type: &str, entity_id: &str, sequence: u64) -> String {
    format!("{event_type}:{entity_id}:{sequence}")
}

/// Compose a `domain:entity:action` event name.
pub fn event_type(domain: &str, entity: &str, action: &str) -> String {
    format!("{domain}:{entity}:{action}")
}

/// Sequence stream for a run.
pub fn stream_run(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Sequence stream for a run node.
pub fn stream_node(run_node_id: &str) -> String {
    format!("node:{run_node_id}")
}

/// Sequence stream for a thread.
pub fn stream_thread(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// Room key for run subscribers.
pub fn room_run(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Room key for node subscribers.
pub fn room_node(run_node_id: &str) -> String {
    format!("node:{run_node_id}")
}

/// Room key for thread subscribers.
pub fn room_thread(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_format() {
        assert_eq!(
            event_type("flowchart", "node", "succeeded"),
            "flowchart:node:succeeded"
        );
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = idempotency_key("flowchart:run:started", "run-1", 4);
        let b = idempotency_key("flowchart:run:started", "run-1", 4);
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key("flowchart:run:started", "run-1", 5));
    }

    #[test]
    fn staged_event_on_run_targets_run_stream_and_room() {
        let staged = StagedEvent::on_run(
            "run-9",
            event_type("flowchart", "run", "started"),
            "flowchart_run",
            "run-9",
            serde_json::json!({"status": "running"}),
        );
        assert_eq!(staged.sequence_stream, "run:run-9");
        assert_eq!(staged.room_keys, vec!["run:run-9".to_string()]);

        let staged = staged.also_in(room_node("rn-1"));
        assert_eq!(staged.room_keys.len(), 2);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope {
            event_id: "ev-1".to_string(),
            idempotency_key: "flowchart:run:started:run-1:1".to_string(),
            sequence: 1,
            sequence_stream: "run:run-1".to_string(),
            emitted_at: Utc::now(),
            event_type: "flowchart:run:started".to_string(),
            entity_kind: "flowchart_run".to_string(),
            entity_id: "run-1".to_string(),
            room_keys: vec!["run:run-1".to_string()],
            payload: serde_json::json!({}),
            contract_version: CONTRACT_VERSION.to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
