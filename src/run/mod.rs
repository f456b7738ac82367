//! Run coordination.
//!
//! `state` holds the persisted record types and status machines,
//! `activation` computes the frontier, `input` assembles node context,
//! `routing` interprets executor routing declarations, and `orchestrator`
//! ties them to the store, dispatcher, and realtime publisher.

pub mod activation;
pub mod input;
pub mod orchestrator;
pub mod routing;
pub mod state;

pub use activation::{ActivationState, NodeProgress, RunOutcome};
pub use input::{AssembledInput, assemble_input};
pub use orchestrator::{OrchestratorConfig, RunOrchestrator, StopMode, TickOutcome};
pub use routing::{RoutingState, parse_routing_state};
pub use state::{
    AdapterMode, Artifact, ArtifactKind, DispatchStatus, FlowchartRun, FlowchartRunNode,
    NodeStatus, RetentionMode, RunStatus, TriggerKind,
};
