//! Run and run-node state records.
//!
//! `FlowchartRun` and `FlowchartRunNode` are the canonical persisted
//! records; status enums here define the legal lifecycle. Dispatch status
//! is deliberately separate from node status: a node can be `failed` while
//! its dispatch reached `dispatch_confirmed`, and a node whose dispatch is
//! ambiguous is always `failed` with `dispatch_uncertain` set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use llmctl_contract::ErrorEnvelope;

use crate::flowchart::NodeType;

/// Lifecycle status of a flowchart run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::Failed | Self::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl NodeStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether the node can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch state machine position of one node attempt.
///
/// Transitions are monotonic in declared order; `can_transition` is the
/// single source of truth and is enforced again at the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    DispatchPending,
    DispatchSubmitted,
    DispatchConfirmed,
    DispatchFailed,
}

impl DispatchStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DispatchPending => "dispatch_pending",
            Self::DispatchSubmitted => "dispatch_submitted",
            Self::DispatchConfirmed => "dispatch_confirmed",
            Self::DispatchFailed => "dispatch_failed",
        }
    }

    /// Whether a dispatch id is required in this state.
    pub fn requires_dispatch_id(&self) -> bool {
        matches!(self, Self::DispatchSubmitted | Self::DispatchConfirmed)
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// Legal moves: pending→submitted, pending→failed, submitted→confirmed,
    /// submitted→failed. Confirmed and failed are terminal for the machine;
    /// node-level failure after confirmation does not touch dispatch state.
    pub fn can_transition(&self, next: DispatchStatus) -> bool {
        use DispatchStatus::*;
        matches!(
            (self, next),
            (DispatchPending, DispatchSubmitted)
                | (DispatchPending, DispatchFailed)
                | (DispatchSubmitted, DispatchConfirmed)
                | (DispatchSubmitted, DispatchFailed)
        )
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Explicit user trigger.
    Manual,
    /// Scheduled/automated trigger; instruction priorities apply.
    Autorun,
    /// Quick no-graph trigger routed through a synthesized flowchart.
    Quick,
}

impl TriggerKind {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Autorun => "autorun",
            Self::Quick => "quick",
        }
    }
}

/// Which adapter shape the instruction package took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    /// Provider-native on-disk file at the sandbox root.
    Native,
    /// Structured prompt envelope; nothing written.
    Fallback,
}

impl AdapterMode {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Fallback => "fallback",
        }
    }
}

/// One execution instance of a flowchart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowchartRun {
    pub run_id: String,
    pub flowchart_snapshot_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_kind: TriggerKind,
    pub request_id: String,
    pub correlation_id: String,
    pub runtime_cutover_enabled: bool,
}

/// One node's execution record within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowchartRunNode {
    pub run_node_id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub attempt_index: u32,
    pub status: NodeStatus,
    pub dispatch_status: DispatchStatus,
    pub dispatch_uncertain: bool,
    /// Globally unique when non-null; namespaced `kubernetes:<job_name>`.
    pub provider_dispatch_id: Option<String>,
    pub k8s_job_name: Option<String>,
    pub k8s_pod_name: Option<String>,
    pub k8s_terminal_reason: Option<String>,
    /// Stable logical workspace key.
    pub workspace_identity: String,
    pub selected_provider: String,
    pub final_provider: Option<String>,
    pub output_state: Option<Value>,
    pub routing_state: Option<Value>,
    pub error: Option<ErrorEnvelope>,
    pub instruction_manifest_hash: Option<String>,
    pub instruction_adapter_mode: Option<AdapterMode>,
    pub resolved_agent_id: Option<String>,
    pub resolved_role_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowchartRunNode {
    /// Fresh queued record for a newly activated node.
    pub fn activated(
        run_node_id: impl Into<String>,
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        attempt_index: u32,
        workspace_identity: impl Into<String>,
    ) -> Self {
        Self {
            run_node_id: run_node_id.into(),
            run_id: run_id.into(),
            node_id: node_id.into(),
            node_type,
            attempt_index,
            status: NodeStatus::Queued,
            dispatch_status: DispatchStatus::DispatchPending,
            dispatch_uncertain: false,
            provider_dispatch_id: None,
            k8s_job_name: None,
            k8s_pod_name: None,
            k8s_terminal_reason: None,
            workspace_identity: workspace_identity.into(),
            selected_provider: "kubernetes".to_string(),
            final_provider: None,
            output_state: None,
            routing_state: None,
            error: None,
            instruction_manifest_hash: None,
            instruction_adapter_mode: None,
            resolved_agent_id: None,
            resolved_role_id: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Typed artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plan,
    Memory,
    Milestone,
    Decision,
    RagIndex,
    RagQuery,
    WorkspacePatch,
    Generic,
}

impl ArtifactKind {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Memory => "memory",
            Self::Milestone => "milestone",
            Self::Decision => "decision",
            Self::RagIndex => "rag_index",
            Self::RagQuery => "rag_query",
            Self::WorkspacePatch => "workspace_patch",
            Self::Generic => "generic",
        }
    }
}

/// Artifact retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    /// Keep forever.
    #[default]
    Keep,
    /// Prune once older than `retention_ttl_seconds`.
    Ttl,
    /// Keep at most `retention_max_count` per node, newest first.
    MaxCount,
}

/// Typed persisted output of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub run_node_id: String,
    pub kind: ArtifactKind,
    pub payload: Value,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub retention_mode: RetentionMode,
    pub retention_ttl_seconds: Option<u64>,
    pub retention_max_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn dispatch_transitions_are_monotonic() {
        use DispatchStatus::*;
        assert!(DispatchPending.can_transition(DispatchSubmitted));
        assert!(DispatchPending.can_transition(DispatchFailed));
        assert!(DispatchSubmitted.can_transition(DispatchConfirmed));
        assert!(DispatchSubmitted.can_transition(DispatchFailed));

        // No backward or reflexive moves.
        assert!(!DispatchSubmitted.can_transition(DispatchPending));
        assert!(!DispatchConfirmed.can_transition(DispatchSubmitted));
        assert!(!DispatchConfirmed.can_transition(DispatchPending));
        assert!(!DispatchConfirmed.can_transition(DispatchFailed));
        assert!(!DispatchFailed.can_transition(DispatchSubmitted));
        assert!(!DispatchFailed.can_transition(DispatchConfirmed));
        assert!(!DispatchPending.can_transition(DispatchPending));
        // Confirmation cannot be skipped.
        assert!(!DispatchPending.can_transition(DispatchConfirmed));
    }

    #[test]
    fn dispatch_id_required_states() {
        assert!(!DispatchStatus::DispatchPending.requires_dispatch_id());
        assert!(DispatchStatus::DispatchSubmitted.requires_dispatch_id());
        assert!(DispatchStatus::DispatchConfirmed.requires_dispatch_id());
        assert!(!DispatchStatus::DispatchFailed.requires_dispatch_id());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&DispatchStatus::DispatchSubmitted).unwrap(),
            "\"dispatch_submitted\""
        );
        assert_eq!(serde_json::to_string(&RunStatus::Stopping).unwrap(), "\"stopping\"");
        assert_eq!(serde_json::to_string(&NodeStatus::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!(serde_json::to_string(&TriggerKind::Autorun).unwrap(), "\"autorun\"");
        assert_eq!(serde_json::to_string(&AdapterMode::Fallback).unwrap(), "\"fallback\"");
    }

    #[test]
    fn activated_node_starts_pending() {
        let node = FlowchartRunNode::activated("rn-1", "run-1", "a", NodeType::Task, 0, "ws-1");
        assert_eq!(node.status, NodeStatus::Queued);
        assert_eq!(node.dispatch_status, DispatchStatus::DispatchPending);
        assert!(!node.dispatch_uncertain);
        assert!(node.provider_dispatch_id.is_none());
        assert_eq!(node.selected_provider, "kubernetes");
    }

    #[test]
    fn artifact_kind_wire_strings() {
        assert_eq!(ArtifactKind::RagIndex.as_str(), "rag_index");
        assert_eq!(
            serde_json::to_string(&ArtifactKind::WorkspacePatch).unwrap(),
            "\"workspace_patch\""
        );
    }
}
