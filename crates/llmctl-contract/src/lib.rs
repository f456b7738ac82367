//! Wire contract between the llmctl orchestrator and the ephemeral node
//! executor.
//!
//! Both sides of the dispatch boundary depend on this crate and nothing
//! else: the orchestrator serializes an [`ExecutionRequest`] into the Job
//! payload, the executor prints a startup marker, runs the node, and prints
//! one [`ExecutionResult`] line behind the result terminator. Everything
//! here is plain serde data - no IO, no async.

pub mod error;
pub mod marker;
pub mod request;
pub mod result;

pub use error::{ErrorCode, ErrorEnvelope};
pub use marker::{StartupMarker, parse_startup_marker};
pub use request::{ExecutionRequest, NodeExecution, SandboxPaths};
pub use result::{ContractViolation, ExecutionResult, ExecutionStatus, extract_result_line};

/// Version of the request contract the orchestrator speaks.
pub const EXECUTION_CONTRACT_VERSION: &str = "v1";

/// Version of the result contract the orchestrator accepts.
pub const RESULT_CONTRACT_VERSION: &str = "v1";

/// Environment variable the executor reads its request payload from when
/// stdin is not used.
pub const PAYLOAD_ENV_VAR: &str = "LLMCTL_EXECUTOR_PAYLOAD_JSON";
