//! Workspace filesystem domain.
//!
//! All paths are resolved against the context's workspace root and
//! confined lexically: absolute paths and any traversal above the root
//! fail with `validation_error` before touching the filesystem.

use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use walkdir::WalkDir;

use llmctl_contract::ErrorCode;

use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// The `workspace` tool domain.
pub struct WorkspaceDomain;

/// Resolve a relative path inside the sandbox root.
///
/// Purely lexical: `..` components pop, popping past the root or an
/// absolute input is a confinement violation.
pub(crate) fn resolve_confined(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(format!("absolute path '{relative}' is outside the workspace"));
    }
    let mut depth: usize = 0;
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(format!("path '{relative}' escapes the workspace root"));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{relative}' is outside the workspace"));
            }
        }
    }
    Ok(resolved)
}

#[derive(Deserialize)]
struct PathArg {
    path: String,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct RenameArgs {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct ChmodArgs {
    path: String,
    /// Octal mode string, e.g. "755".
    mode: String,
}

#[derive(Deserialize)]
struct PatchEdit {
    path: String,
    old_text: String,
    new_text: String,
}

#[derive(Deserialize)]
struct ApplyPatchArgs {
    edits: Vec<PatchEdit>,
}

#[async_trait]
impl ToolDomain for WorkspaceDomain {
    fn name(&self) -> &'static str {
        "workspace"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "list" => self.list(ctx, payload),
            "read" => self.read(ctx, payload),
            "write" => self.write(ctx, payload),
            "apply_patch" => self.apply_patch(ctx, payload),
            "rename" => self.rename(ctx, payload),
            "chmod" => self.chmod(ctx, payload),
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown workspace operation '{other}'"),
            ),
        }
    }
}

impl WorkspaceDomain {
    fn list(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: ListArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let base = match resolve_confined(&ctx.workspace_root, &args.path) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };

        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&base).sort_by_file_name().into_iter().flatten() {
            if entry.path() == base {
                continue;
            }
            if entries.len() >= ctx.limits.max_files {
                truncated = true;
                break;
            }
            let relative = entry
                .path()
                .strip_prefix(&ctx.workspace_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            entries.push(json!({
                "path": relative,
                "is_dir": entry.file_type().is_dir(),
            }));
        }

        let mut outcome = DomainOutcome::ok()
            .with_count("entries", entries.len() as u64)
            .with_data(json!({"entries": entries}));
        if truncated {
            outcome = outcome.with_warning(format!(
                "listing truncated at {} entries",
                ctx.limits.max_files
            ));
        }
        outcome
    }

    fn read(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: PathArg = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let path = match resolve_confined(&ctx.workspace_root, &args.path) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("cannot read '{}': {e}", args.path),
                );
            }
        };
        let total = content.len();
        let (content, truncated) = if total > ctx.limits.max_output_bytes {
            (
                content
                    .char_indices()
                    .take_while(|(i, _)| *i < ctx.limits.max_output_bytes)
                    .map(|(_, c)| c)
                    .collect::<String>(),
                true,
            )
        } else {
            (content, false)
        };

        let mut outcome = DomainOutcome::ok()
            .with_count("bytes", total as u64)
            .with_data(json!({"content": content}));
        if truncated {
            outcome = outcome.with_warning(format!(
                "content truncated to {} of {total} bytes",
                ctx.limits.max_output_bytes
            ));
        }
        outcome
    }

    fn write(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: WriteArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let path = match resolve_confined(&ctx.workspace_root, &args.path) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };
        if let Some(parent) = path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot create parent of '{}': {e}", args.path),
            );
        }
        match fs::write(&path, &args.content) {
            Ok(()) => DomainOutcome::ok().with_count("bytes_written", args.content.len() as u64),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot write '{}': {e}", args.path),
            ),
        }
    }

    /// Apply a set of exact-match edits atomically: every `old_text` must
    /// occur exactly once in its file, all edits are staged in memory, and
    /// nothing is written unless every edit stages cleanly.
    fn apply_patch(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: ApplyPatchArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        if args.edits.is_empty() {
            return DomainOutcome::fail(ErrorCode::ValidationError, "patch has no edits");
        }

        let mut staged: Vec<(PathBuf, String)> = Vec::new();
        for edit in &args.edits {
            let path = match resolve_confined(&ctx.workspace_root, &edit.path) {
                Ok(path) => path,
                Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
            };
            let current = staged
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, content)| content.clone())
                .or_else(|| fs::read_to_string(&path).ok());
            let Some(current) = current else {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("patch target '{}' does not exist", edit.path),
                );
            };
            let occurrences = current.matches(&edit.old_text).count();
            if occurrences == 0 {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!("patch text not found in '{}'", edit.path),
                );
            }
            if occurrences > 1 {
                return DomainOutcome::fail(
                    ErrorCode::ValidationError,
                    format!(
                        "patch text is ambiguous in '{}' ({occurrences} matches)",
                        edit.path
                    ),
                );
            }
            let updated = current.replacen(&edit.old_text, &edit.new_text, 1);
            staged.retain(|(p, _)| *p != path);
            staged.push((path, updated));
        }

        for (path, content) in &staged {
            if let Err(e) = fs::write(path, content) {
                return DomainOutcome::fail(
                    ErrorCode::ExecutionError,
                    format!("cannot write patched file '{}': {e}", path.display()),
                );
            }
        }
        DomainOutcome::ok()
            .with_count("edits", args.edits.len() as u64)
            .with_count("files", staged.len() as u64)
    }

    fn rename(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: RenameArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let from = match resolve_confined(&ctx.workspace_root, &args.from) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };
        let to = match resolve_confined(&ctx.workspace_root, &args.to) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };
        if let Some(parent) = to.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot create parent of '{}': {e}", args.to),
            );
        }
        match fs::rename(&from, &to) {
            Ok(()) => DomainOutcome::ok().with_count("renamed", 1),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot rename '{}' to '{}': {e}", args.from, args.to),
            ),
        }
    }

    fn chmod(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: ChmodArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let path = match resolve_confined(&ctx.workspace_root, &args.path) {
            Ok(path) => path,
            Err(message) => return DomainOutcome::fail(ErrorCode::ValidationError, message),
        };
        let Ok(mode) = u32::from_str_radix(&args.mode, 8) else {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("invalid octal mode '{}'", args.mode),
            );
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            match fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
                Ok(()) => DomainOutcome::ok().with_count("changed", 1),
                Err(e) => DomainOutcome::fail(
                    ErrorCode::ExecutionError,
                    format!("cannot chmod '{}': {e}", args.path),
                ),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            DomainOutcome::ok().with_warning("chmod is a no-op on this platform")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolDomainRegistry, TraceStatus};
    use std::sync::Arc;

    fn ctx(root: &Path) -> ToolDomainContext {
        ToolDomainContext::new(root, "exec-1", "req-1", "corr-1")
    }

    fn registry() -> ToolDomainRegistry {
        ToolDomainRegistry::new().register(Arc::new(WorkspaceDomain))
    }

    #[test]
    fn confinement_rejects_escapes() {
        let root = Path::new("/sandbox/run-1");
        assert!(resolve_confined(root, "notes/todo.md").is_ok());
        assert!(resolve_confined(root, "a/../b").is_ok());
        assert!(resolve_confined(root, "../outside").is_err());
        assert!(resolve_confined(root, "a/../../outside").is_err());
        assert!(resolve_confined(root, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let ctx = ctx(dir.path());

        let trace = registry
            .invoke(
                "workspace",
                "write",
                &ctx,
                &json!({"path": "notes/a.txt", "content": "hello"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.counts.get("bytes_written"), Some(&5));

        let trace = registry
            .invoke("workspace", "read", &ctx, &json!({"path": "notes/a.txt"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.data.unwrap()["content"], "hello");
    }

    #[tokio::test]
    async fn traversal_fails_with_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let trace = registry
            .invoke(
                "workspace",
                "write",
                &ctx(dir.path()),
                &json!({"path": "../escape.txt", "content": "x"}),
            )
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
        // Nothing was written outside the root.
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn list_is_sorted_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let registry = registry();
        let mut ctx = ctx(dir.path());
        ctx.limits.max_files = 1;
        let trace = registry
            .invoke("workspace", "list", &ctx, &json!({}))
            .await;
        assert_eq!(trace.status, TraceStatus::Warning);
        assert_eq!(trace.counts.get("entries"), Some(&1));
        assert_eq!(trace.data.unwrap()["entries"][0]["path"], "a.txt");
    }

    #[tokio::test]
    async fn apply_patch_ambiguous_match_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "dup dup").unwrap();

        let registry = registry();
        let trace = registry
            .invoke(
                "workspace",
                "apply_patch",
                &ctx(dir.path()),
                &json!({"edits": [{"path": "f.txt", "old_text": "dup", "new_text": "one"}]}),
            )
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "dup dup"
        );
    }

    #[tokio::test]
    async fn apply_patch_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "alpha").unwrap();

        let registry = registry();
        let trace = registry
            .invoke(
                "workspace",
                "apply_patch",
                &ctx(dir.path()),
                &json!({"edits": [
                    {"path": "ok.txt", "old_text": "alpha", "new_text": "beta"},
                    {"path": "ok.txt", "old_text": "missing", "new_text": "x"}
                ]}),
            )
            .await;
        assert!(trace.is_error());
        // The first edit staged fine but must not have been written.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ok.txt")).unwrap(),
            "alpha"
        );
    }

    #[tokio::test]
    async fn rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "v").unwrap();

        let registry = registry();
        let trace = registry
            .invoke(
                "workspace",
                "rename",
                &ctx(dir.path()),
                &json!({"from": "old.txt", "to": "sub/new.txt"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(dir.path().join("sub/new.txt").exists());
        assert!(!dir.path().join("old.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chmod_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("script.sh"), "#!/bin/sh\n").unwrap();

        let registry = registry();
        let trace = registry
            .invoke(
                "workspace",
                "chmod",
                &ctx(dir.path()),
                &json!({"path": "script.sh", "mode": "755"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let mode = std::fs::metadata(dir.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn unknown_operation_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let trace = registry
            .invoke("workspace", "truncate", &ctx(dir.path()), &json!({}))
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
    }
}
