//! Milestone domain.
//!
//! Milestones live at `.state/milestones.json`. The domain exposes field
//! mutations (`set_status`, `set_priority`, `set_health`) with the same
//! id-then-key matching rules as the other document domains; values are
//! validated against closed sets.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use llmctl_contract::ErrorCode;

use super::matching::{MatchOutcome, match_target, read_state_doc, write_state_doc};
use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// The `milestone` tool domain.
pub struct MilestoneDomain;

const STATUSES: &[&str] = &["planned", "active", "done", "blocked"];
const PRIORITIES: &[&str] = &["low", "medium", "high", "critical"];
const HEALTHS: &[&str] = &["green", "yellow", "red"];

#[derive(Debug, Clone, Deserialize)]
struct MilestoneEntry {
    #[serde(default)]
    id: Option<String>,
    key: String,
    title: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default = "default_health")]
    health: String,
}

fn default_status() -> String {
    "planned".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_health() -> String {
    "green".to_string()
}

#[derive(Deserialize)]
struct AppendArgs {
    milestones: Vec<MilestoneEntry>,
}

#[derive(Deserialize)]
struct TargetRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Deserialize)]
struct MutateArgs {
    targets: Vec<TargetRef>,
    value: String,
}

fn empty_doc() -> Value {
    json!({"milestones": []})
}

fn doc_targets(doc: &Value) -> Vec<(Option<String>, Option<String>)> {
    doc["milestones"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|m| {
                    (
                        m["id"].as_str().map(String::from),
                        m["key"].as_str().map(String::from),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ToolDomain for MilestoneDomain {
    fn name(&self) -> &'static str {
        "milestone"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "append" => self.append(ctx, payload),
            "set_status" => self.mutate(ctx, payload, "status", STATUSES),
            "set_priority" => self.mutate(ctx, payload, "priority", PRIORITIES),
            "set_health" => self.mutate(ctx, payload, "health", HEALTHS),
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown milestone operation '{other}'"),
            ),
        }
    }
}

impl MilestoneDomain {
    fn append(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: AppendArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        for entry in &args.milestones {
            if !STATUSES.contains(&entry.status.as_str()) {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("unknown milestone status '{}'", entry.status),
                );
            }
            if !PRIORITIES.contains(&entry.priority.as_str()) {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("unknown milestone priority '{}'", entry.priority),
                );
            }
            if !HEALTHS.contains(&entry.health.as_str()) {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("unknown milestone health '{}'", entry.health),
                );
            }
        }
        let mut doc = match read_state_doc(&ctx.workspace_root, "milestones", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };
        let appended = args.milestones.len() as u64;
        let Some(list) = doc["milestones"].as_array_mut() else {
            return DomainOutcome::fail(
                ErrorCode::ExecutionError,
                "milestone document is not a list",
            );
        };
        for entry in args.milestones {
            list.push(json!({
                "id": entry.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                "key": entry.key,
                "title": entry.title,
                "status": entry.status,
                "priority": entry.priority,
                "health": entry.health,
            }));
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "milestones", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }
        DomainOutcome::ok().with_count("appended", appended)
    }

    fn mutate(
        &self,
        ctx: &ToolDomainContext,
        payload: &Value,
        field: &str,
        allowed: &[&str],
    ) -> DomainOutcome {
        let args: MutateArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        if !allowed.contains(&args.value.as_str()) {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("'{}' is not a valid milestone {field}", args.value),
            );
        }
        let mut doc = match read_state_doc(&ctx.workspace_root, "milestones", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };

        let entries = doc_targets(&doc);
        let mut staged: Vec<usize> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        for target in &args.targets {
            match match_target(&entries, target.id.as_deref(), target.key.as_deref()) {
                MatchOutcome::One(index) => staged.push(index),
                MatchOutcome::Missing => skipped.push(
                    target
                        .id
                        .clone()
                        .or_else(|| target.key.clone())
                        .unwrap_or_else(|| "<no target>".to_string()),
                ),
                MatchOutcome::Ambiguous(count) => {
                    return DomainOutcome::fail(
                        ErrorCode::ValidationError,
                        format!(
                            "milestone target '{}' is ambiguous ({count} matches)",
                            target.id.clone().or_else(|| target.key.clone()).unwrap_or_default()
                        ),
                    );
                }
            }
        }

        let updated = staged.len() as u64;
        for index in staged {
            doc["milestones"][index][field] = Value::String(args.value.clone());
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "milestones", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }

        let mut outcome = DomainOutcome::ok()
            .with_count("updated", updated)
            .with_count("skipped_missing", skipped.len() as u64);
        for target in skipped {
            outcome =
                outcome.with_warning(format!("milestone target '{target}' not found; skipped"));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolDomainRegistry, TraceStatus};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, ToolDomainRegistry, ToolDomainContext) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolDomainRegistry::new().register(Arc::new(MilestoneDomain));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");
        (dir, registry, ctx)
    }

    async fn seed(registry: &ToolDomainRegistry, ctx: &ToolDomainContext) {
        let trace = registry
            .invoke(
                "milestone",
                "append",
                ctx,
                &json!({"milestones": [
                    {"id": "M1", "key": "beta", "title": "Beta launch"},
                    {"id": "M2", "key": "ga", "title": "GA"}
                ]}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
    }

    #[tokio::test]
    async fn set_status_by_id() {
        let (_dir, registry, ctx) = setup();
        seed(&registry, &ctx).await;

        let trace = registry
            .invoke(
                "milestone",
                "set_status",
                &ctx,
                &json!({"targets": [{"id": "M1"}], "value": "active"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let doc = read_state_doc(&ctx.workspace_root, "milestones", empty_doc()).unwrap();
        assert_eq!(doc["milestones"][0]["status"], "active");
    }

    #[tokio::test]
    async fn invalid_value_is_rejected() {
        let (_dir, registry, ctx) = setup();
        seed(&registry, &ctx).await;

        let trace = registry
            .invoke(
                "milestone",
                "set_health",
                &ctx,
                &json!({"targets": [{"id": "M1"}], "value": "purple"}),
            )
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn missing_target_skips_with_warning() {
        let (_dir, registry, ctx) = setup();
        seed(&registry, &ctx).await;

        let trace = registry
            .invoke(
                "milestone",
                "set_priority",
                &ctx,
                &json!({"targets": [{"id": "M2"}, {"key": "ghost"}], "value": "high"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Warning);
        assert_eq!(trace.counts.get("updated"), Some(&1));
        assert_eq!(trace.counts.get("skipped_missing"), Some(&1));
    }

    #[tokio::test]
    async fn ambiguous_target_fails_whole_operation() {
        let (_dir, registry, ctx) = setup();
        registry
            .invoke(
                "milestone",
                "append",
                &ctx,
                &json!({"milestones": [
                    {"key": "Launch", "title": "A"},
                    {"key": "launch", "title": "B"}
                ]}),
            )
            .await;

        let trace = registry
            .invoke(
                "milestone",
                "set_status",
                &ctx,
                &json!({"targets": [{"key": "launch"}], "value": "done"}),
            )
            .await;
        assert!(trace.is_error());
        let doc = read_state_doc(&ctx.workspace_root, "milestones", empty_doc()).unwrap();
        assert_eq!(doc["milestones"][0]["status"], "planned");
    }
}
