//! Plan document domain.
//!
//! The plan document at `.state/plan.json` holds stages with nested tasks.
//! Update patches select a stage (and optionally a task inside it) by id
//! with normalized-key fallback. A malformed patch or an ambiguous match
//! fails the whole operation with nothing persisted; a missing target is
//! skipped with a warning.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use llmctl_contract::ErrorCode;

use super::matching::{MatchOutcome, match_target, read_state_doc, write_state_doc};
use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// The `plan` tool domain.
pub struct PlanDomain;

#[derive(Debug, Clone, Deserialize)]
struct PlanTask {
    #[serde(default)]
    id: Option<String>,
    key: String,
    name: String,
    #[serde(default = "default_status")]
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PlanStage {
    #[serde(default)]
    id: Option<String>,
    key: String,
    name: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    tasks: Vec<PlanTask>,
}

fn default_status() -> String {
    "pending".to_string()
}

#[derive(Deserialize)]
struct StagesArgs {
    stages: Vec<PlanStage>,
}

#[derive(Debug, Deserialize)]
struct UpdatePatch {
    #[serde(default)]
    stage_id: Option<String>,
    #[serde(default)]
    stage_key: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    task_key: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    patches: Vec<UpdatePatch>,
}

fn empty_doc() -> Value {
    json!({"stages": []})
}

fn stage_value(stage: PlanStage) -> Value {
    json!({
        "id": stage.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        "key": stage.key,
        "name": stage.name,
        "status": stage.status,
        "tasks": stage
            .tasks
            .into_iter()
            .map(|task| {
                json!({
                    "id": task.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    "key": task.key,
                    "name": task.name,
                    "status": task.status,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn id_key_pairs(list: &Value) -> Vec<(Option<String>, Option<String>)> {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    (
                        item["id"].as_str().map(String::from),
                        item["key"].as_str().map(String::from),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A staged mutation: stage index, optional task index, fields to set.
struct StagedPatch {
    stage: usize,
    task: Option<usize>,
    status: Option<String>,
    name: Option<String>,
}

#[async_trait]
impl ToolDomain for PlanDomain {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "append" => self.append(ctx, payload),
            "replace" => self.replace(ctx, payload),
            "update" => self.update(ctx, payload),
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown plan operation '{other}'"),
            ),
        }
    }
}

impl PlanDomain {
    fn append(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: StagesArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let mut doc = match read_state_doc(&ctx.workspace_root, "plan", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };
        let appended = args.stages.len() as u64;
        let Some(list) = doc["stages"].as_array_mut() else {
            return DomainOutcome::fail(ErrorCode::ExecutionError, "plan document is not a list");
        };
        for stage in args.stages {
            list.push(stage_value(stage));
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "plan", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }
        DomainOutcome::ok().with_count("appended", appended)
    }

    fn replace(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: StagesArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let count = args.stages.len() as u64;
        let doc = json!({
            "stages": args.stages.into_iter().map(stage_value).collect::<Vec<_>>()
        });
        if let Err(message) = write_state_doc(&ctx.workspace_root, "plan", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }
        DomainOutcome::ok().with_count("replaced", count)
    }

    fn update(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: UpdateArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let mut doc = match read_state_doc(&ctx.workspace_root, "plan", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };

        let stages = id_key_pairs(&doc["stages"]);
        let mut staged: Vec<StagedPatch> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for patch in &args.patches {
            if patch.status.is_none() && patch.name.is_none() {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    "plan patch sets neither status nor name",
                );
            }
            if patch.stage_id.is_none() && patch.stage_key.is_none() {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    "plan patch has no stage selector",
                );
            }

            let stage_index = match match_target(
                &stages,
                patch.stage_id.as_deref(),
                patch.stage_key.as_deref(),
            ) {
                MatchOutcome::One(index) => index,
                MatchOutcome::Missing => {
                    skipped.push(describe_target(patch));
                    continue;
                }
                MatchOutcome::Ambiguous(count) => {
                    return DomainOutcome::fail(
                        ErrorCode::ValidationError,
                        format!(
                            "plan stage target '{}' is ambiguous ({count} matches)",
                            describe_target(patch)
                        ),
                    );
                }
            };

            let task_index = if patch.task_id.is_some() || patch.task_key.is_some() {
                let tasks = id_key_pairs(&doc["stages"][stage_index]["tasks"]);
                match match_target(&tasks, patch.task_id.as_deref(), patch.task_key.as_deref()) {
                    MatchOutcome::One(index) => Some(index),
                    MatchOutcome::Missing => {
                        skipped.push(describe_target(patch));
                        continue;
                    }
                    MatchOutcome::Ambiguous(count) => {
                        return DomainOutcome::fail(
                            ErrorCode::ValidationError,
                            format!(
                                "plan task target '{}' is ambiguous ({count} matches)",
                                describe_target(patch)
                            ),
                        );
                    }
                }
            } else {
                None
            };

            staged.push(StagedPatch {
                stage: stage_index,
                task: task_index,
                status: patch.status.clone(),
                name: patch.name.clone(),
            });
        }

        let updated = staged.len() as u64;
        for patch in staged {
            let target = match patch.task {
                Some(task) => &mut doc["stages"][patch.stage]["tasks"][task],
                None => &mut doc["stages"][patch.stage],
            };
            if let Some(status) = patch.status {
                target["status"] = Value::String(status);
            }
            if let Some(name) = patch.name {
                target["name"] = Value::String(name);
            }
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "plan", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }

        let mut outcome = DomainOutcome::ok()
            .with_count("updated", updated)
            .with_count("skipped_missing", skipped.len() as u64);
        for target in skipped {
            outcome = outcome.with_warning(format!("plan target '{target}' not found; skipped"));
        }
        outcome
    }
}

fn describe_target(patch: &UpdatePatch) -> String {
    patch
        .task_id
        .clone()
        .or_else(|| patch.task_key.clone())
        .or_else(|| patch.stage_id.clone())
        .or_else(|| patch.stage_key.clone())
        .unwrap_or_else(|| "<none>".to_string())
}
