//! Execution result envelope - executor to orchestrator.
//!
//! The executor prints exactly one result line on stdout, prefixed by the
//! terminator marker. stdout lines before the marker are free logging and
//! are preserved but carry no contract meaning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::RESULT_CONTRACT_VERSION;
use crate::error::{ErrorCode, ErrorEnvelope};

/// Prefix of the single stdout line carrying the result JSON.
pub const RESULT_LINE_PREFIX: &str = "LLMCTL_EXECUTOR_RESULT_JSON=";

/// Terminal status reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Node ran to completion; `output_state` and `routing_state` are present.
    Success,
    /// Node execution failed.
    Failed,
    /// Cancellation was observed mid-execution.
    Cancelled,
    /// The execution timed out inside the executor.
    Timeout,
    /// The executor could not even begin dispatching the node.
    DispatchFailed,
    /// The executor cannot say whether the node ran.
    DispatchUncertain,
    /// Infrastructure-level failure unrelated to the node itself.
    InfraError,
}

impl ExecutionStatus {
    /// Whether this status represents a successful node.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Ways a result document can violate the contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("result contract version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: String, got: String },

    #[error("no result line found on executor stdout")]
    MissingResultLine,

    #[error("result line is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("status {status:?} requires a non-null error envelope")]
    MissingError { status: ExecutionStatus },

    #[error("success result must not carry an error envelope")]
    UnexpectedError,

    #[error("success result is missing {field}")]
    MissingSuccessField { field: &'static str },
}

/// The executor's result document, version `v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Result contract version.
    pub contract_version: String,
    /// Terminal status of the execution.
    pub status: ExecutionStatus,
    /// Process exit code.
    pub exit_code: i32,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Captured stdout (before the result marker).
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: String,
    /// Typed error; `null` iff `status == success`.
    pub error: Option<ErrorEnvelope>,
    /// Opaque provider/runtime metadata.
    #[serde(default)]
    pub provider_metadata: Value,
    /// Node output; present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_state: Option<Value>,
    /// Routing declaration; present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_state: Option<Value>,
}

impl ExecutionResult {
    /// Validate the contract rules that cut across fields.
    ///
    /// A version mismatch is the caller's signal to classify the node as
    /// `infra_error`; the other violations mean the executor is broken.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.contract_version != RESULT_CONTRACT_VERSION {
            return Err(ContractViolation::VersionMismatch {
                expected: RESULT_CONTRACT_VERSION.to_string(),
                got: self.contract_version.clone(),
            });
        }
        match self.status {
            ExecutionStatus::Success => {
                if self.error.is_some() {
                    return Err(ContractViolation::UnexpectedError);
                }
                if self.output_state.is_none() {
                    return Err(ContractViolation::MissingSuccessField {
                        field: "output_state",
                    });
                }
                if self.routing_state.is_none() {
                    return Err(ContractViolation::MissingSuccessField {
                        field: "routing_state",
                    });
                }
            }
            status => {
                if self.error.is_none() {
                    return Err(ContractViolation::MissingError { status });
                }
            }
        }
        Ok(())
    }

    /// The error code of a non-success result, defaulting to `unknown` when
    /// the envelope is (contract-violatingly) absent.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.status.is_success() {
            return None;
        }
        Some(self.error.as_ref().map_or(ErrorCode::Unknown, |e| e.code))
    }
}

/// Extract and parse the result document from raw executor stdout.
///
/// Scans for lines starting with [`RESULT_LINE_PREFIX`]; the last such line
/// wins. Lines before it are contract-irrelevant logging.
pub fn extract_result_line(stdout: &str) -> Result<ExecutionResult, ContractViolation> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(RESULT_LINE_PREFIX))
        .ok_or(ContractViolation::MissingResultLine)?;
    serde_json::from_str(line).map_err(|e| ContractViolation::MalformedJson(e.to_string()))
}
