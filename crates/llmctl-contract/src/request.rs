//! Execution request envelope - orchestrator to executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EXECUTION_CONTRACT_VERSION, RESULT_CONTRACT_VERSION};

/// One node's work, handed to the ephemeral executor as a single JSON
/// document (stdin or the payload environment variable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Request contract version, currently `v1`.
    pub contract_version: String,
    /// Result contract version the orchestrator expects back.
    pub result_contract_version: String,
    /// Dispatch provider; `kubernetes` in the current scope.
    pub provider: String,
    /// Cross-cutting request id for tracing.
    pub request_id: String,
    /// Unique id of this execution attempt.
    pub execution_id: String,
    /// Node being executed.
    pub node_id: String,
    /// Node type tag (`task`, `decision`, ...).
    pub node_type: String,
    /// Hard wall-clock budget for the whole execution.
    pub timeout_seconds: u64,
    /// The serialized node request.
    pub node_execution: NodeExecution,
    /// Ask the executor to print startup markers before doing anything else.
    pub emit_start_markers: bool,
}

impl ExecutionRequest {
    /// Build a request with the current contract versions and marker
    /// emission enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        request_id: impl Into<String>,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        timeout_seconds: u64,
        node_execution: NodeExecution,
    ) -> Self {
        Self {
            contract_version: EXECUTION_CONTRACT_VERSION.to_string(),
            result_contract_version: RESULT_CONTRACT_VERSION.to_string(),
            provider: "kubernetes".to_string(),
            request_id: request_id.into(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            node_type: node_type.into(),
            timeout_seconds,
            node_execution,
            emit_start_markers: true,
        }
    }
}

/// Everything the executor needs to run one node end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Node configuration as stored in the flowchart definition.
    pub configuration: Value,
    /// Concatenated predecessor output, in stable predecessor order.
    #[serde(default)]
    pub input_context: String,
    /// Attachment references propagated along attachment edges.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Providers the node may call.
    #[serde(default)]
    pub enabled_providers: Vec<String>,
    /// Default model id when the node does not pin one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model_id: Option<String>,
    /// MCP server keys selected for the node.
    #[serde(default)]
    pub mcp_server_keys: Vec<String>,
    /// Per-run sandbox paths inside the executor container.
    pub sandbox: SandboxPaths,
}

/// Sandbox filesystem layout inside the executor container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPaths {
    /// Absolute per-run workspace root; all tool operations are confined here.
    pub workspace_root: String,
    /// Instruction package directory under the workspace root.
    pub instructions_dir: String,
}

impl SandboxPaths {
    /// Conventional layout: instructions live under `.instructions/` at the
    /// workspace root.
    pub fn for_workspace(workspace_root: impl Into<String>) -> Self {
        let workspace_root = workspace_root.into();
        let instructions_dir = format!("{}/.instructions", workspace_root.trim_end_matches('/'));
        Self {
            workspace_root,
            instructions_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_execution() -> NodeExecution {
        NodeExecution {
            configuration: serde_json::json!({"prompt": "summarize"}),
            input_context: "previous output".to_string(),
            attachments: vec![],
            enabled_providers: vec!["claude".to_string()],
            default_model_id: Some("claude-sonnet".to_string()),
            mcp_server_keys: vec!["github".to_string()],
            sandbox: SandboxPaths::for_workspace("/workspace/run-1"),
        }
    }

    #[test]
    fn v1_constructor_stamps_versions() {
        let req = ExecutionRequest::v1("req-1", "exec-1", "node-a", "task", 900, sample_execution());
        assert_eq!(req.contract_version, "v1");
        assert_eq!(req.result_contract_version, "v1");
        assert_eq!(req.provider, "kubernetes");
        assert!(req.emit_start_markers);
    }

    #[test]
    fn request_round_trips() {
        let req = ExecutionRequest::v1("req-1", "exec-1", "node-a", "task", 900, sample_execution());
        let json = serde_json::to_string(&req).unwrap();
        let back: ExecutionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn sandbox_paths_layout() {
        let paths = SandboxPaths::for_workspace("/workspace/run-9/");
        assert_eq!(paths.instructions_dir, "/workspace/run-9/.instructions");
    }

    #[test]
    fn optional_fields_default_on_deserialize() {
        let json = serde_json::json!({
            "configuration": {},
            "sandbox": {"workspace_root": "/w", "instructions_dir": "/w/.instructions"}
        });
        let exec: NodeExecution = serde_json::from_value(json).unwrap();
        assert!(exec.input_context.is_empty());
        assert!(exec.enabled_providers.is_empty());
        assert!(exec.default_model_id.is_none());
    }
}
