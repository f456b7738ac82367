//! RAG domain.
//!
//! The indexing/search engine itself is an external collaborator behind
//! [`RagEngine`]; this domain adapts its three operations into the trace
//! contract. [`InMemoryRagEngine`] is a deterministic stand-in used by
//! tests and local development: it indexes workspace text files and scores
//! queries by token overlap.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use walkdir::WalkDir;

use llmctl_contract::ErrorCode;

use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// One query hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagHit {
    /// Indexed document id (workspace-relative path for file-backed docs).
    pub document_id: String,
    /// Relevance score; higher is better.
    pub score: f64,
    /// Snippet of the matching document.
    pub snippet: String,
}

/// Indexing/search engine interface.
#[async_trait]
pub trait RagEngine: Send + Sync {
    /// Rebuild a collection from scratch. Returns the indexed doc count.
    async fn full_index(&self, collection: &str, ctx: &ToolDomainContext)
    -> Result<u64, String>;

    /// Index only documents not yet in the collection. Returns the count
    /// of newly indexed docs.
    async fn delta_index(&self, collection: &str, ctx: &ToolDomainContext)
    -> Result<u64, String>;

    /// Query a collection.
    async fn query(
        &self,
        collection: &str,
        text: &str,
        top_k: usize,
        ctx: &ToolDomainContext,
    ) -> Result<Vec<RagHit>, String>;
}

/// Deterministic in-memory engine over workspace text files.
#[derive(Default)]
pub struct InMemoryRagEngine {
    /// collection -> document id -> content
    collections: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryRagEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn scan_workspace(ctx: &ToolDomainContext) -> Vec<(String, String)> {
        let mut docs = Vec::new();
        for entry in WalkDir::new(&ctx.workspace_root)
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_text = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "md" | "txt" | "rst"));
            if !is_text {
                continue;
            }
            if docs.len() >= ctx.limits.max_files {
                break;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let id = entry
                .path()
                .strip_prefix(&ctx.workspace_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            docs.push((id, content));
        }
        docs
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl RagEngine for InMemoryRagEngine {
    async fn full_index(
        &self,
        collection: &str,
        ctx: &ToolDomainContext,
    ) -> Result<u64, String> {
        let docs = Self::scan_workspace(ctx);
        let count = docs.len() as u64;
        let mut collections = self.collections.lock().map_err(|_| "engine poisoned")?;
        collections.insert(collection.to_string(), docs.into_iter().collect());
        Ok(count)
    }

    async fn delta_index(
        &self,
        collection: &str,
        ctx: &ToolDomainContext,
    ) -> Result<u64, String> {
        let docs = Self::scan_workspace(ctx);
        let mut collections = self.collections.lock().map_err(|_| "engine poisoned")?;
        let existing = collections.entry(collection.to_string()).or_default();
        let mut added = 0;
        for (id, content) in docs {
            if !existing.contains_key(&id) {
                existing.insert(id, content);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        top_k: usize,
        _ctx: &ToolDomainContext,
    ) -> Result<Vec<RagHit>, String> {
        let collections = self.collections.lock().map_err(|_| "engine poisoned")?;
        let Some(docs) = collections.get(collection) else {
            return Err(format!("collection '{collection}' is not indexed"));
        };
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<RagHit> = docs
            .iter()
            .filter_map(|(id, content)| {
                let doc_tokens = tokenize(content);
                let overlap = query_tokens
                    .iter()
                    .filter(|t| doc_tokens.contains(t))
                    .count();
                if overlap == 0 {
                    return None;
                }
                Some(RagHit {
                    document_id: id.clone(),
                    score: overlap as f64 / query_tokens.len() as f64,
                    snippet: content.chars().take(160).collect(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[derive(Deserialize)]
struct CollectionArgs {
    collection: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    collection: String,
    text: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// The `rag` tool domain.
pub struct RagDomain {
    engine: Arc<dyn RagEngine>,
}

impl RagDomain {
    /// Domain over the given engine.
    pub fn new(engine: Arc<dyn RagEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ToolDomain for RagDomain {
    fn name(&self) -> &'static str {
        "rag"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "full_index" => {
                let args: CollectionArgs = match super::parse_payload(payload) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self.engine.full_index(&args.collection, ctx).await {
                    Ok(indexed) => DomainOutcome::ok().with_count("indexed", indexed),
                    Err(message) => DomainOutcome::fail(ErrorCode::ProviderError, message),
                }
            }
            "delta_index" => {
                let args: CollectionArgs = match super::parse_payload(payload) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self.engine.delta_index(&args.collection, ctx).await {
                    Ok(added) => DomainOutcome::ok().with_count("indexed", added),
                    Err(message) => DomainOutcome::fail(ErrorCode::ProviderError, message),
                }
            }
            "query" => {
                let args: QueryArgs = match super::parse_payload(payload) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self
                    .engine
                    .query(&args.collection, &args.text, args.top_k, ctx)
                    .await
                {
                    Ok(hits) => DomainOutcome::ok()
                        .with_count("hits", hits.len() as u64)
                        .with_data(json!({"hits": hits})),
                    Err(message) => DomainOutcome::fail(ErrorCode::ProviderError, message),
                }
            }
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown rag operation '{other}'"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolDomainRegistry, TraceStatus};

    fn setup() -> (tempfile::TempDir, ToolDomainRegistry, ToolDomainContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("deploy.md"),
            "blue green deploys reduce risk",
        )
        .unwrap();
        std::fs::write(dir.path().join("retro.md"), "retro notes about meetings").unwrap();
        std::fs::write(dir.path().join("binary.bin"), "ignored").unwrap();

        let registry =
            ToolDomainRegistry::new().register(Arc::new(RagDomain::new(Arc::new(
                InMemoryRagEngine::new(),
            ))));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");
        (dir, registry, ctx)
    }

    #[tokio::test]
    async fn full_index_then_query() {
        let (_dir, registry, ctx) = setup();

        let trace = registry
            .invoke("rag", "full_index", &ctx, &json!({"collection": "docs"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.counts.get("indexed"), Some(&2));

        let trace = registry
            .invoke(
                "rag",
                "query",
                &ctx,
                &json!({"collection": "docs", "text": "deploy risk", "top_k": 1}),
            )
            .await;
        assert_eq!(trace.counts.get("hits"), Some(&1));
        let data = trace.data.unwrap();
        assert_eq!(data["hits"][0]["document_id"], "deploy.md");
    }

    #[tokio::test]
    async fn delta_index_adds_only_new_documents() {
        let (dir, registry, ctx) = setup();
        registry
            .invoke("rag", "full_index", &ctx, &json!({"collection": "docs"}))
            .await;

        std::fs::write(dir.path().join("new.md"), "fresh content").unwrap();
        let trace = registry
            .invoke("rag", "delta_index", &ctx, &json!({"collection": "docs"}))
            .await;
        assert_eq!(trace.counts.get("indexed"), Some(&1));
    }

    #[tokio::test]
    async fn query_unindexed_collection_is_provider_error() {
        let (_dir, registry, ctx) = setup();
        let trace = registry
            .invoke(
                "rag",
                "query",
                &ctx,
                &json!({"collection": "ghost", "text": "anything"}),
            )
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ProviderError);
    }
}
