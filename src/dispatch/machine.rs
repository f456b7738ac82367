//! Dispatch state machine.
//!
//! A small in-memory machine mirroring the persisted dispatch columns.
//! Every transition is validated against the declared order before the
//! store is touched; the store enforces the same rules again, so an
//! illegal transition can never be observed, only reported.

use crate::errors::DispatchError;
use crate::run::state::DispatchStatus;

/// In-memory dispatch state for one node attempt.
#[derive(Debug, Clone)]
pub struct DispatchMachine {
    run_node_id: String,
    attempt_index: u32,
    status: DispatchStatus,
    provider_dispatch_id: Option<String>,
    uncertain: bool,
}

impl DispatchMachine {
    /// Fresh machine in `dispatch_pending`.
    pub fn new(run_node_id: impl Into<String>, attempt_index: u32) -> Self {
        Self {
            run_node_id: run_node_id.into(),
            attempt_index,
            status: DispatchStatus::DispatchPending,
            provider_dispatch_id: None,
            uncertain: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> DispatchStatus {
        self.status
    }

    /// Dispatch id once submitted.
    pub fn provider_dispatch_id(&self) -> Option<&str> {
        self.provider_dispatch_id.as_deref()
    }

    /// Whether the machine ended ambiguous.
    pub fn is_uncertain(&self) -> bool {
        self.uncertain
    }

    fn transition(&mut self, next: DispatchStatus) -> Result<(), DispatchError> {
        if !self.status.can_transition(next) {
            return Err(DispatchError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `dispatch_pending -> dispatch_submitted`, binding the dispatch id.
    pub fn submitted(&mut self, provider_dispatch_id: impl Into<String>) -> Result<(), DispatchError> {
        let id = provider_dispatch_id.into();
        if id.is_empty() {
            return Err(DispatchError::MissingDispatchId {
                run_node_id: self.run_node_id.clone(),
                attempt_index: self.attempt_index,
            });
        }
        self.transition(DispatchStatus::DispatchSubmitted)?;
        self.provider_dispatch_id = Some(id);
        Ok(())
    }

    /// `dispatch_submitted -> dispatch_confirmed`.
    pub fn confirmed(&mut self) -> Result<(), DispatchError> {
        self.transition(DispatchStatus::DispatchConfirmed)
    }

    /// Terminal failure; `uncertain` marks fail-closed ambiguity.
    pub fn failed(&mut self, uncertain: bool) -> Result<(), DispatchError> {
        self.transition(DispatchStatus::DispatchFailed)?;
        self.uncertain = uncertain;
        Ok(())
    }
}
