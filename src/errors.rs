//! Typed error hierarchy for the llmctl orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError` — run coordination and activation failures
//! - `DispatchError` — Kubernetes dispatch and state machine failures
//! - `StoreError` — persistence failures
//!
//! These are internal control-flow types. The wire-level taxonomy that
//! crosses the executor boundary lives in `llmctl_contract::ErrorCode` and
//! is never reconstructed from these enums by string matching.

use thiserror::Error;

use crate::run::state::{DispatchStatus, RunStatus};

/// Errors from the run orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is already running")]
    AlreadyRunning { run_id: String },

    #[error("Run {run_id} is {status} and cannot be started")]
    NotStartable { run_id: String, status: RunStatus },

    #[error("Flowchart rejected: {0}")]
    FlowchartInvalid(#[from] crate::flowchart::GraphError),

    #[error("Instruction compilation failed: {0}")]
    Compile(#[from] crate::instructions::CompileError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the dispatcher and its state machine.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Illegal dispatch transition {from} -> {to}")]
    IllegalTransition {
        from: DispatchStatus,
        to: DispatchStatus,
    },

    #[error("Dispatch for node {run_node_id} attempt {attempt_index} requires a provider dispatch id")]
    MissingDispatchId {
        run_node_id: String,
        attempt_index: u32,
    },

    #[error("Malformed image reference '{reference}': {message}")]
    MalformedImageReference { reference: String, message: String },

    #[error("Kubernetes API error: {0}")]
    JobApi(String),

    #[error("Kubeconfig missing or invalid: {0}")]
    Kubeconfig(String),

    #[error("Executor result violates contract: {0}")]
    Contract(#[from] llmctl_contract::ContractViolation),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Shorthand for a missing-row error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
