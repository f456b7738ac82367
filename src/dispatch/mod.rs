//! Node dispatch subsystem.
//!
//! The orchestrator hands one [`DispatchTicket`] per node attempt to a
//! [`NodeDispatcher`], listens to its event channel for the submit and
//! confirmation milestones, and receives a terminal [`DispatchReport`].
//! The Kubernetes implementation runs one ephemeral Job per ticket; tests
//! use scripted dispatchers behind the same trait.

mod image;
mod job;
mod kubernetes;
mod machine;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use llmctl_contract::{ErrorCode, ErrorEnvelope, ExecutionRequest};

pub use image::ImageReference;
pub use job::{build_job, job_name, provider_dispatch_id};
pub use kubernetes::KubernetesDispatcher;
pub use machine::DispatchMachine;

use crate::flowchart::RuntimeClass;

/// Everything the dispatcher needs to run one node attempt.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub run_id: String,
    pub run_node_id: String,
    pub attempt_index: u32,
    pub workspace_identity: String,
    pub runtime_class: RuntimeClass,
    pub request: ExecutionRequest,
    /// Extra executor environment (resolved integration bundle).
    pub env: Vec<(String, String)>,
}

/// Milestones the dispatcher reports while a ticket is in flight.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// The Job was accepted by the API server.
    Submitted {
        provider_dispatch_id: String,
        job_name: String,
    },
    /// A valid startup marker arrived before any terminal state.
    Confirmed { pod_name: Option<String> },
}

/// How a dispatch ended, before interpreting the executor result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDisposition {
    /// The executor returned a result envelope.
    Completed,
    /// Submission or startup failed; the node never confirmably ran.
    DispatchFailed,
    /// Fail-closed ambiguity: the node may or may not have run. Only
    /// reported before confirmation; post-confirmation breakage is `Infra`.
    DispatchUncertain,
    /// No terminal Job state within the execution timeout.
    TimedOut,
    /// Cancellation was observed.
    Canceled,
    /// Contract/infrastructure failure.
    Infra,
}

/// Terminal report for one ticket.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub disposition: DispatchDisposition,
    /// Parsed executor result when the disposition is `Completed`.
    pub result: Option<llmctl_contract::ExecutionResult>,
    /// Error envelope for every non-completed disposition.
    pub error: Option<ErrorEnvelope>,
    pub pod_name: Option<String>,
    pub terminal_reason: Option<String>,
    /// Raw provider metadata worth persisting (job conditions etc).
    pub provider_metadata: Value,
}

impl DispatchReport {
    /// Completed report around a parsed executor result.
    pub fn completed(result: llmctl_contract::ExecutionResult) -> Self {
        Self {
            disposition: DispatchDisposition::Completed,
            result: Some(result),
            error: None,
            pod_name: None,
            terminal_reason: None,
            provider_metadata: Value::Null,
        }
    }

    /// Failed report with the given disposition and error.
    pub fn failed(disposition: DispatchDisposition, error: ErrorEnvelope) -> Self {
        Self {
            disposition,
            result: None,
            error: Some(error),
            pod_name: None,
            terminal_reason: None,
            provider_metadata: Value::Null,
        }
    }

    /// Fail-closed ambiguous report.
    pub fn uncertain(message: impl Into<String>) -> Self {
        Self::failed(
            DispatchDisposition::DispatchUncertain,
            ErrorEnvelope::new(ErrorCode::DispatchError, message).with_retryable(false),
        )
    }

    /// Attach the terminal Job reason.
    pub fn with_terminal_reason(mut self, reason: impl Into<String>) -> Self {
        self.terminal_reason = Some(reason.into());
        self
    }

    /// Attach the pod name.
    pub fn with_pod_name(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self
    }
}

/// Submits one ephemeral execution per ticket.
///
/// Implementations must be idempotent on `(run_node_id, attempt_index)`:
/// re-dispatching an already submitted ticket must adopt the existing
/// execution instead of creating a second one.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    /// Run one ticket to a terminal report, emitting milestones on `events`.
    async fn dispatch(
        &self,
        ticket: DispatchTicket,
        events: mpsc::Sender<DispatchEvent>,
        cancel: CancellationToken,
    ) -> DispatchReport;

    /// Cancel an in-flight dispatch by job name. Graceful cancel waits for
    /// the grace window; force overrides it.
    async fn cancel(&self, job_name: &str, force: bool) -> Result<(), crate::errors::DispatchError>;
}
