//! Activation frontier computation.
//!
//! Pure in-memory view of one run's progress. A node activates when every
//! inbound activation-gating edge has fired; an edge fires when its source
//! succeeded and, for decision sources, its route key is in the declared
//! matched set. Context-only and attachment-only edges never gate.
//!
//! Start and end markers are structural: start fires its outgoing edges at
//! initialization, end nodes absorb activation without dispatching.

use std::collections::HashSet;

use crate::flowchart::{EdgeIndex, FlowchartGraph, NodeIndex, NodeType};

/// Per-node progress within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeProgress {
    /// Not yet eligible or eligible-but-not-claimed.
    NotActivated,
    /// Activated and dispatched (or executing).
    Active,
    /// Terminal success.
    Succeeded,
    /// Terminal failure; `fatal` dooms the run.
    Failed { fatal: bool },
    /// Terminal cancellation.
    Canceled,
}

impl NodeProgress {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Canceled
        )
    }
}

/// Aggregate run outcome once the frontier is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Canceled,
}

/// Frontier state for one run.
#[derive(Debug)]
pub struct ActivationState {
    progress: Vec<NodeProgress>,
    fired_edges: HashSet<EdgeIndex>,
}

impl ActivationState {
    /// Initial state: the start marker (when present) has already fired
    /// its outgoing edges.
    pub fn new(graph: &FlowchartGraph) -> Self {
        let mut state = Self {
            progress: vec![NodeProgress::NotActivated; graph.node_count()],
            fired_edges: HashSet::new(),
        };
        if let Some(start) = graph.start() {
            state.progress[start] = NodeProgress::Succeeded;
            for &edge in graph.outgoing(start) {
                state.fired_edges.insert(edge);
            }
        }
        state
    }

    /// Nodes eligible to activate now: not yet activated, dispatchable or
    /// absorbing, with every inbound gating edge fired.
    pub fn eligible(&self, graph: &FlowchartGraph) -> Vec<NodeIndex> {
        (0..graph.node_count())
            .filter(|&index| {
                if self.progress[index] != NodeProgress::NotActivated {
                    return false;
                }
                if graph.node(index).node_type == NodeType::Start {
                    return false;
                }
                graph.incoming(index).iter().all(|&edge| {
                    !graph.edge(edge).routing_mode.gates_activation()
                        || self.fired_edges.contains(&edge)
                })
            })
            .collect()
    }

    /// Claim a node as active.
    pub fn mark_active(&mut self, index: NodeIndex) {
        self.progress[index] = NodeProgress::Active;
    }

    /// Record success and fire outgoing edges.
    ///
    /// For decision nodes only edges whose `route_key` is in
    /// `matched_connector_ids` fire; for other nodes every outgoing edge
    /// fires. Returns the edges that fired.
    pub fn mark_succeeded(
        &mut self,
        graph: &FlowchartGraph,
        index: NodeIndex,
        matched_connector_ids: &[String],
    ) -> Vec<EdgeIndex> {
        self.progress[index] = NodeProgress::Succeeded;
        let is_decision = graph.node(index).node_type == NodeType::Decision;
        let mut fired = Vec::new();
        for &edge in graph.outgoing(index) {
            let fires = if is_decision {
                graph
                    .edge(edge)
                    .route_key
                    .as_deref()
                    .is_some_and(|key| matched_connector_ids.iter().any(|m| m == key))
            } else {
                true
            };
            if fires {
                self.fired_edges.insert(edge);
                fired.push(edge);
            }
        }
        fired
    }

    /// Record a failure; `fatal` marks the run as doomed.
    pub fn mark_failed(&mut self, index: NodeIndex, fatal: bool) {
        self.progress[index] = NodeProgress::Failed { fatal };
    }

    /// Record a cancellation.
    pub fn mark_canceled(&mut self, index: NodeIndex) {
        self.progress[index] = NodeProgress::Canceled;
    }

    /// Progress of one node.
    pub fn progress(&self, index: NodeIndex) -> &NodeProgress {
        &self.progress[index]
    }

    /// Count of nodes currently active.
    pub fn active_count(&self) -> usize {
        self.progress
            .iter()
            .filter(|p| **p == NodeProgress::Active)
            .count()
    }

    /// Whether nothing is active and nothing further can activate.
    pub fn is_quiescent(&self, graph: &FlowchartGraph) -> bool {
        self.active_count() == 0 && self.eligible(graph).is_empty()
    }

    /// Aggregate outcome once quiescent: cancellation beats failure, any
    /// fatal failure beats completion. Non-fatal failures (nodes declaring
    /// failure-tolerance) do not block completion.
    pub fn outcome(&self) -> RunOutcome {
        if self
            .progress
            .iter()
            .any(|p| *p == NodeProgress::Canceled)
        {
            return RunOutcome::Canceled;
        }
        if self
            .progress
            .iter()
            .any(|p| matches!(p, NodeProgress::Failed { fatal: true }))
        {
            return RunOutcome::Failed;
        }
        RunOutcome::Completed
    }

    /// Terminal node count (for progress reporting).
    pub fn terminal_count(&self) -> usize {
        self.progress.iter().filter(|p| p.is_terminal()).count()
    }
}
