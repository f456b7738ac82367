//! Tool domain framework.
//!
//! Deterministic, sandboxed operations callable from domain nodes and from
//! the SDK tool loop inside the executor. Every invocation goes through
//! the registry and comes back as a [`ToolTrace`]: domain, operation,
//! status, counts, warnings, typed errors, duration. Traces are attached
//! to the node's artifact; tool failures never escape the sandbox.

mod command;
mod decision;
mod gitops;
mod matching;
mod memory;
mod milestone;
mod plan;
mod rag;
mod workspace;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use llmctl_contract::{ErrorCode, ErrorEnvelope};

pub use command::CommandDomain;
pub use decision::{DecisionDomain, evaluate_conditions};
pub use gitops::GitDomain;
pub use matching::{MatchOutcome, match_target, normalize_key};
pub use memory::MemoryDomain;
pub use milestone::MilestoneDomain;
pub use plan::PlanDomain;
pub use rag::{InMemoryRagEngine, RagDomain, RagEngine, RagHit};
pub use workspace::WorkspaceDomain;

use crate::credentials::CredentialResolver;

/// Bounded invocation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLimits {
    /// Wall-clock budget for one operation, in seconds.
    pub timeout_seconds: u64,
    /// Output capture ceiling in bytes; excess is truncated with a warning.
    pub max_output_bytes: usize,
    /// Listing ceiling.
    pub max_files: usize,
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            max_output_bytes: 1024 * 1024,
            max_files: 1000,
        }
    }
}

/// Per-invocation context handed to every domain.
#[derive(Debug, Clone)]
pub struct ToolDomainContext {
    /// Absolute per-run sandbox root; all filesystem work is confined here.
    pub workspace_root: PathBuf,
    /// Execution attempt id.
    pub execution_id: String,
    /// Cross-cutting request id.
    pub request_id: String,
    /// Cross-cutting correlation id.
    pub correlation_id: String,
    /// Invocation limits.
    pub limits: OperationLimits,
}

impl ToolDomainContext {
    /// Context rooted at the given workspace with default limits.
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        execution_id: impl Into<String>,
        request_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            execution_id: execution_id.into(),
            request_id: request_id.into(),
            correlation_id: correlation_id.into(),
            limits: OperationLimits::default(),
        }
    }
}

/// Trace status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Warning,
    Error,
}

/// What a domain reports back to the registry.
#[derive(Debug, Clone, Default)]
pub struct DomainOutcome {
    /// Operation counts (`updated`, `skipped_missing`, ...).
    pub counts: BTreeMap<String, u64>,
    /// Soft warnings.
    pub warnings: Vec<String>,
    /// Typed errors; non-empty means the operation failed.
    pub errors: Vec<ErrorEnvelope>,
    /// Operation result payload.
    pub data: Option<Value>,
}

impl DomainOutcome {
    /// Successful empty outcome.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Failed outcome with one typed error.
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            errors: vec![ErrorEnvelope::new(code, message)],
            ..Self::default()
        }
    }

    /// Add a count.
    pub fn with_count(mut self, key: &str, value: u64) -> Self {
        self.counts.insert(key.to_string(), value);
        self
    }

    /// Add a warning.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Attach a result payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn status(&self) -> TraceStatus {
        if !self.errors.is_empty() {
            TraceStatus::Error
        } else if !self.warnings.is_empty() {
            TraceStatus::Warning
        } else {
            TraceStatus::Success
        }
    }
}

/// Typed trace envelope for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTrace {
    pub domain: String,
    pub operation: String,
    pub status: TraceStatus,
    pub counts: BTreeMap<String, u64>,
    pub warnings: Vec<String>,
    pub errors: Vec<ErrorEnvelope>,
    pub duration_ms: u64,
    pub request_id: String,
    pub correlation_id: String,
    /// Operation result payload, when the operation produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolTrace {
    /// Whether the invocation failed.
    pub fn is_error(&self) -> bool {
        self.status == TraceStatus::Error
    }
}

/// A named family of deterministic operations.
#[async_trait]
pub trait ToolDomain: Send + Sync {
    /// Domain name used for dispatch.
    fn name(&self) -> &'static str;

    /// Execute one operation against the sandbox.
    async fn execute(&self, operation: &str, ctx: &ToolDomainContext, payload: &Value)
    -> DomainOutcome;
}

/// Dispatches invocations to registered domains and stamps traces.
pub struct ToolDomainRegistry {
    domains: HashMap<&'static str, Arc<dyn ToolDomain>>,
}

impl ToolDomainRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            domains: HashMap::new(),
        }
    }

    /// Register one domain; later registrations win.
    pub fn register(mut self, domain: Arc<dyn ToolDomain>) -> Self {
        self.domains.insert(domain.name(), domain);
        self
    }

    /// The standard domain set.
    pub fn standard(
        credentials: Arc<dyn CredentialResolver>,
        rag_engine: Arc<dyn RagEngine>,
    ) -> Self {
        Self::new()
            .register(Arc::new(WorkspaceDomain))
            .register(Arc::new(GitDomain::new(credentials)))
            .register(Arc::new(CommandDomain::new()))
            .register(Arc::new(MemoryDomain))
            .register(Arc::new(PlanDomain))
            .register(Arc::new(MilestoneDomain))
            .register(Arc::new(DecisionDomain))
            .register(Arc::new(RagDomain::new(rag_engine)))
    }

    /// Registered domain names.
    pub fn domain_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.domains.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Invoke one operation, producing its trace.
    pub async fn invoke(
        &self,
        domain: &str,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> ToolTrace {
        let started = Instant::now();
        let outcome = match self.domains.get(domain) {
            Some(handler) => handler.execute(operation, ctx, payload).await,
            None => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown tool domain '{domain}'"),
            ),
        };
        ToolTrace {
            domain: domain.to_string(),
            operation: operation.to_string(),
            status: outcome.status(),
            counts: outcome.counts,
            warnings: outcome.warnings,
            errors: outcome.errors,
            duration_ms: started.elapsed().as_millis() as u64,
            request_id: ctx.request_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            data: outcome.data,
        }
    }
}

impl Default for ToolDomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an operation payload, mapping failures to `validation_error`.
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &Value,
) -> Result<T, DomainOutcome> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        DomainOutcome::fail(ErrorCode::ValidationError, format!("invalid payload: {e}"))
    })
}

/// Default ceiling on SDK tool-loop iterations.
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 24;

/// Bounded iteration guard for the provider SDK tool loop.
///
/// The executor calls [`ToolLoopGuard::begin_iteration`] before every tool
/// cycle; exceeding the ceiling fails the node with `execution_error`.
#[derive(Debug)]
pub struct ToolLoopGuard {
    max_iterations: u32,
    used: u32,
}

impl ToolLoopGuard {
    /// Guard with the default ceiling.
    pub fn new() -> Self {
        Self::with_max(DEFAULT_MAX_TOOL_ITERATIONS)
    }

    /// Guard with an explicit ceiling.
    pub fn with_max(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            used: 0,
        }
    }

    /// Claim the next iteration (1-based), or fail the loop.
    pub fn begin_iteration(&mut self) -> Result<u32, ErrorEnvelope> {
        if self.used >= self.max_iterations {
            return Err(ErrorEnvelope::new(
                ErrorCode::ExecutionError,
                format!(
                    "tool loop exceeded {} iterations without completing",
                    self.max_iterations
                ),
            ));
        }
        self.used += 1;
        Ok(self.used)
    }

    /// Iterations consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }
}

impl Default for ToolLoopGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &std::path::Path) -> ToolDomainContext {
        ToolDomainContext::new(root, "exec-1", "req-1", "corr-1")
    }

    #[tokio::test]
    async fn unknown_domain_yields_validation_error_trace() {
        let registry = ToolDomainRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let trace = registry
            .invoke("nope", "run", &ctx(dir.path()), &Value::Null)
            .await;
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
        assert_eq!(trace.domain, "nope");
        assert_eq!(trace.request_id, "req-1");
    }

    #[tokio::test]
    async fn trace_carries_warning_status() {
        struct Warny;
        #[async_trait]
        impl ToolDomain for Warny {
            fn name(&self) -> &'static str {
                "warny"
            }
            async fn execute(
                &self,
                _operation: &str,
                _ctx: &ToolDomainContext,
                _payload: &Value,
            ) -> DomainOutcome {
                DomainOutcome::ok().with_warning("heads up").with_count("touched", 1)
            }
        }

        let registry = ToolDomainRegistry::new().register(Arc::new(Warny));
        let dir = tempfile::tempdir().unwrap();
        let trace = registry
            .invoke("warny", "anything", &ctx(dir.path()), &Value::Null)
            .await;
        assert_eq!(trace.status, TraceStatus::Warning);
        assert_eq!(trace.counts.get("touched"), Some(&1));
    }

    #[test]
    fn tool_loop_guard_enforces_ceiling() {
        let mut guard = ToolLoopGuard::with_max(2);
        assert_eq!(guard.begin_iteration().unwrap(), 1);
        assert_eq!(guard.begin_iteration().unwrap(), 2);
        let err = guard.begin_iteration().unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert_eq!(guard.used(), 2);
    }

    #[test]
    fn default_loop_ceiling_is_24() {
        let guard = ToolLoopGuard::new();
        assert_eq!(guard.max_iterations, 24);
    }
}
