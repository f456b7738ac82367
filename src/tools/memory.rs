//! Memory document domain.
//!
//! The memory document lives at `.state/memory.json` inside the sandbox:
//! a flat list of `{id, key, content}` entries. Updates match by id with
//! normalized-key fallback; an ambiguous match fails the whole operation,
//! missing targets are skipped with a warning.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use llmctl_contract::ErrorCode;

use super::matching::{MatchOutcome, match_target, read_state_doc, write_state_doc};
use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// The `memory` tool domain.
pub struct MemoryDomain;

#[derive(Debug, Clone, Deserialize)]
struct MemoryEntry {
    #[serde(default)]
    id: Option<String>,
    key: String,
    content: String,
}

#[derive(Deserialize)]
struct EntriesArgs {
    entries: Vec<MemoryEntry>,
}

#[derive(Deserialize)]
struct UpdatePatch {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    content: String,
}

#[derive(Deserialize)]
struct UpdateArgs {
    patches: Vec<UpdatePatch>,
}

fn empty_doc() -> Value {
    json!({"entries": []})
}

fn doc_entries(doc: &Value) -> Vec<(Option<String>, Option<String>)> {
    doc["entries"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|e| {
                    (
                        e["id"].as_str().map(String::from),
                        e["key"].as_str().map(String::from),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ToolDomain for MemoryDomain {
    fn name(&self) -> &'static str {
        "memory"
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
                format!("unknown memory operation '{other}'"),
            ),
        }
    }
}

impl MemoryDomain {
    fn append(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: EntriesArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let mut doc = match read_state_doc(&ctx.workspace_root, "memory", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };
        let appended = args.entries.len() as u64;
        let list = doc["entries"].as_array_mut();
        let Some(list) = list else {
            return DomainOutcome::fail(ErrorCode::ExecutionError, "memory document is not a list");
        };
        for entry in args.entries {
            list.push(json!({
                "id": entry.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                "key": entry.key,
                "content": entry.content,
            }));
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "memory", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }
        DomainOutcome::ok().with_count("appended", appended)
    }

    fn replace(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: EntriesArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let entries: Vec<Value> = args
            .entries
            .into_iter()
            .map(|entry| {
                json!({
                    "id": entry.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    "key": entry.key,
                    "content": entry.content,
                })
            })
            .collect();
        let count = entries.len() as u64;
        let doc = json!({"entries": entries});
        if let Err(message) = write_state_doc(&ctx.workspace_root, "memory", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }
        DomainOutcome::ok().with_count("replaced", count)
    }

    fn update(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: UpdateArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let mut doc = match read_state_doc(&ctx.workspace_root, "memory", empty_doc()) {
            Ok(doc) => doc,
            Err(message) => return DomainOutcome::fail(ErrorCode::ExecutionError, message),
        };

        // Stage all matches before mutating anything: an ambiguous match
        // must leave the document untouched.
        let targets = doc_entries(&doc);
        let mut staged: Vec<(usize, String)> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        for patch in &args.patches {
            match match_target(&targets, patch.id.as_deref(), patch.key.as_deref()) {
                MatchOutcome::One(index) => staged.push((index, patch.content.clone())),
                MatchOutcome::Missing => {
                    skipped.push(
                        patch
                            .id
                            .clone()
                            .or_else(|| patch.key.clone())
                            .unwrap_or_else(|| "<no target>".to_string()),
                    );
                }
                MatchOutcome::Ambiguous(count) => {
                    return DomainOutcome::fail(
                        ErrorCode::ValidationError,
                        format!(
                            "memory update target '{}' is ambiguous ({count} matches)",
                            patch
                                .id
                                .clone()
                                .or_else(|| patch.key.clone())
                                .unwrap_or_default()
                        ),
                    );
                }
            }
        }

        let updated = staged.len() as u64;
        if let Some(list) = doc["entries"].as_array_mut() {
            for (index, content) in staged {
                list[index]["content"] = Value::String(content);
            }
        }
        if let Err(message) = write_state_doc(&ctx.workspace_root, "memory", &doc) {
            return DomainOutcome::fail(ErrorCode::ExecutionError, message);
        }

        let mut outcome = DomainOutcome::ok()
            .with_count("updated", updated)
            .with_count("skipped_missing", skipped.len() as u64);
        for target in skipped {
            outcome = outcome.with_warning(format!("memory target '{target}' not found; skipped"));
        }
        outcome
    }
}
