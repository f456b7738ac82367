//! Git operations domain.
//!
//! Local history operations go through libgit2 against the repository at
//! the sandbox root. `push` and `open_pr` are the two operations that
//! leave the sandbox; both require a configured integration credential and
//! fail with `provider_error` without one.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use git2::{BranchType, Repository, Signature, build::CheckoutBuilder};
use serde::Deserialize;
use serde_json::{Value, json};

use llmctl_contract::ErrorCode;

use super::{DomainOutcome, ToolDomain, ToolDomainContext};
use crate::credentials::CredentialResolver;

/// Committer identity for orchestrator-made commits.
const GIT_IDENTITY: (&str, &str) = ("llmctl", "llmctl@localhost");

/// The `git` tool domain.
pub struct GitDomain {
    credentials: Arc<dyn CredentialResolver>,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct CommitArgs {
    message: String,
}

#[derive(Deserialize)]
struct TagArgs {
    name: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct CherryPickArgs {
    commit: String,
}

#[derive(Deserialize)]
struct RebaseArgs {
    upstream: String,
}

#[derive(Deserialize)]
struct PushArgs {
    #[serde(default = "default_remote")]
    remote: String,
    #[serde(default)]
    refspec: Option<String>,
}

fn default_remote() -> String {
    "origin".to_string()
}

#[derive(Deserialize)]
struct OpenPrArgs {
    title: String,
    #[serde(default)]
    body: String,
}

impl GitDomain {
    /// Domain with the given credential resolver.
    pub fn new(credentials: Arc<dyn CredentialResolver>) -> Self {
        Self { credentials }
    }

    fn open_repo(ctx: &ToolDomainContext) -> Result<Repository, DomainOutcome> {
        Repository::open(&ctx.workspace_root).map_err(|e| {
            DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("workspace is not a git repository: {e}"),
            )
        })
    }

    fn branch(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: NameArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let head = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(commit) => commit,
            Err(e) => {
                return DomainOutcome::fail(
                    ErrorCode::ExecutionError,
                    format!("cannot resolve HEAD: {e}"),
                );
            }
        };
        match repo.branch(&args.name, &head, false) {
            Ok(_) => DomainOutcome::ok().with_count("created", 1),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot create branch '{}': {e}", args.name),
            ),
        }
    }

    fn checkout(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: NameArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let refname = format!("refs/heads/{}", args.name);
        let result = repo
            .find_branch(&args.name, BranchType::Local)
            .map_err(|e| format!("branch '{}' not found: {e}", args.name))
            .and_then(|_| {
                repo.set_head(&refname)
                    .map_err(|e| format!("cannot set HEAD: {e}"))
            })
            .and_then(|_| {
                repo.checkout_head(Some(CheckoutBuilder::default().force()))
                    .map_err(|e| format!("checkout failed: {e}"))
            });
        match result {
            Ok(()) => DomainOutcome::ok().with_count("checked_out", 1),
            Err(message) => DomainOutcome::fail(ErrorCode::ExecutionError, message),
        }
    }

    /// Stage everything and commit, tolerating an unborn HEAD.
    fn commit(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: CommitArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let result = (|| -> Result<String, git2::Error> {
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
            index.write()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let sig = Signature::now(GIT_IDENTITY.0, GIT_IDENTITY.1)?;
            let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
            let commit_id = match parent {
                Some(parent) => {
                    repo.commit(Some("HEAD"), &sig, &sig, &args.message, &tree, &[&parent])?
                }
                None => repo.commit(Some("HEAD"), &sig, &sig, &args.message, &tree, &[])?,
            };
            Ok(commit_id.to_string())
        })();
        match result {
            Ok(sha) => DomainOutcome::ok()
                .with_count("committed", 1)
                .with_data(json!({"sha": sha})),
            Err(e) => {
                DomainOutcome::fail(ErrorCode::ExecutionError, format!("commit failed: {e}"))
            }
        }
    }

    fn tag(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: TagArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let result = (|| -> Result<(), git2::Error> {
            let head = repo.head()?.peel(git2::ObjectType::Commit)?;
            match &args.message {
                Some(message) => {
                    let sig = Signature::now(GIT_IDENTITY.0, GIT_IDENTITY.1)?;
                    repo.tag(&args.name, &head, &sig, message, false)?;
                }
                None => {
                    repo.tag_lightweight(&args.name, &head, false)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => DomainOutcome::ok().with_count("tagged", 1),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot tag '{}': {e}", args.name),
            ),
        }
    }

    fn cherry_pick(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: CherryPickArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let result = (|| -> Result<String, git2::Error> {
            let oid = git2::Oid::from_str(&args.commit)?;
            let commit = repo.find_commit(oid)?;
            repo.cherrypick(&commit, None)?;

            let mut index = repo.index()?;
            if index.has_conflicts() {
                return Err(git2::Error::from_str("cherry-pick produced conflicts"));
            }
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let sig = Signature::now(GIT_IDENTITY.0, GIT_IDENTITY.1)?;
            let head = repo.head()?.peel_to_commit()?;
            let new_id = repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                commit.message().unwrap_or("cherry-pick"),
                &tree,
                &[&head],
            )?;
            repo.cleanup_state()?;
            Ok(new_id.to_string())
        })();
        match result {
            Ok(sha) => DomainOutcome::ok()
                .with_count("picked", 1)
                .with_data(json!({"sha": sha})),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cherry-pick of '{}' failed: {e}", args.commit),
            ),
        }
    }

    /// Replay the current branch onto `upstream` without any interactive
    /// step; a conflict aborts the rebase and fails the operation.
    fn noninteractive_rebase(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: RebaseArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let result = (|| -> Result<u64, git2::Error> {
            let upstream_ref = repo.resolve_reference_from_short_name(&args.upstream)?;
            let upstream = repo.reference_to_annotated_commit(&upstream_ref)?;
            let sig = Signature::now(GIT_IDENTITY.0, GIT_IDENTITY.1)?;
            let mut rebase = repo.rebase(None, Some(&upstream), None, None)?;
            let mut applied = 0u64;
            while let Some(op) = rebase.next() {
                op?;
                if repo.index()?.has_conflicts() {
                    rebase.abort()?;
                    return Err(git2::Error::from_str("rebase produced conflicts; aborted"));
                }
                rebase.commit(None, &sig, None)?;
                applied += 1;
            }
            rebase.finish(Some(&sig))?;
            Ok(applied)
        })();
        match result {
            Ok(applied) => DomainOutcome::ok().with_count("applied", applied),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("rebase onto '{}' failed: {e}", args.upstream),
            ),
        }
    }

    fn push(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: PushArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let token = match self.credentials.resolve("github", "token") {
            Ok(Some(token)) => token,
            Ok(None) => {
                return DomainOutcome::fail(
                    ErrorCode::ProviderError,
                    "push requires a configured github integration",
                );
            }
            Err(e) => return DomainOutcome::fail(ErrorCode::ProviderError, e.to_string()),
        };
        let repo = match Self::open_repo(ctx) {
            Ok(repo) => repo,
            Err(outcome) => return outcome,
        };
        let result = (|| -> Result<(), git2::Error> {
            let head = repo.head()?;
            let refspec = args.refspec.clone().unwrap_or_else(|| {
                let name = head.name().unwrap_or("refs/heads/main");
                format!("{name}:{name}")
            });
            let mut callbacks = git2::RemoteCallbacks::new();
            callbacks.credentials(move |_url, username, _allowed| {
                git2::Cred::userpass_plaintext(username.unwrap_or("git"), token.expose())
            });
            let mut options = git2::PushOptions::new();
            options.remote_callbacks(callbacks);
            let mut remote = repo.find_remote(&args.remote)?;
            remote.push(&[refspec.as_str()], Some(&mut options))
        })();
        match result {
            Ok(()) => DomainOutcome::ok().with_count("pushed", 1),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ProviderError,
                format!("push to '{}' failed: {e}", args.remote),
            ),
        }
    }

    /// Open a pull request through the `gh` CLI with the integration token.
    async fn open_pr(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: OpenPrArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let token = match self.credentials.resolve("github", "token") {
            Ok(Some(token)) => token,
            Ok(None) => {
                return DomainOutcome::fail(
                    ErrorCode::ProviderError,
                    "open_pr requires a configured github integration",
                );
            }
            Err(e) => return DomainOutcome::fail(ErrorCode::ProviderError, e.to_string()),
        };

        let output = tokio::process::Command::new("gh")
            .args(["pr", "create", "--title", &args.title, "--body", &args.body])
            .current_dir(&ctx.workspace_root)
            .env("GH_TOKEN", token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
                DomainOutcome::ok()
                    .with_count("opened", 1)
                    .with_data(json!({"url": url}))
            }
            Ok(output) => DomainOutcome::fail(
                ErrorCode::ProviderError,
                format!(
                    "gh pr create failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ProviderError,
                format!("cannot run gh: {e}"),
            ),
        }
    }
}

#[async_trait]
impl ToolDomain for GitDomain {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "branch" => self.branch(ctx, payload),
            "checkout" => self.checkout(ctx, payload),
            "commit" => self.commit(ctx, payload),
            "tag" => self.tag(ctx, payload),
            "cherry_pick" => self.cherry_pick(ctx, payload),
            "noninteractive_rebase" => self.noninteractive_rebase(ctx, payload),
            "push" => self.push(ctx, payload),
            "open_pr" => self.open_pr(ctx, payload).await,
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown git operation '{other}'"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;
    use crate::tools::{ToolDomainRegistry, ToolDomainContext, TraceStatus};

    fn setup_repo() -> (tempfile::TempDir, ToolDomainRegistry, ToolDomainContext) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.md"), "# project\n").unwrap();

        let registry = ToolDomainRegistry::new().register(Arc::new(GitDomain::new(Arc::new(
            StaticCredentialResolver::new(),
        ))));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");
        (dir, registry, ctx)
    }

    #[tokio::test]
    async fn commit_then_branch_then_checkout() {
        let (_dir, registry, ctx) = setup_repo();

        let trace = registry
            .invoke("git", "commit", &ctx, &json!({"message": "initial"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(trace.data.unwrap()["sha"].as_str().is_some());

        let trace = registry
            .invoke("git", "branch", &ctx, &json!({"name": "feature/x"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);

        let trace = registry
            .invoke("git", "checkout", &ctx, &json!({"name": "feature/x"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
    }

    #[tokio::test]
    async fn tag_annotated_and_lightweight() {
        let (_dir, registry, ctx) = setup_repo();
        registry
            .invoke("git", "commit", &ctx, &json!({"message": "initial"}))
            .await;

        let trace = registry
            .invoke("git", "tag", &ctx, &json!({"name": "v0.1.0"}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);

        let trace = registry
            .invoke(
                "git",
                "tag",
                &ctx,
                &json!({"name": "v0.2.0", "message": "release"}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
    }

    #[tokio::test]
    async fn push_without_integration_is_provider_error() {
        let (_dir, registry, ctx) = setup_repo();
        registry
            .invoke("git", "commit", &ctx, &json!({"message": "initial"}))
            .await;

        let trace = registry.invoke("git", "push", &ctx, &json!({})).await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ProviderError);
    }

    #[tokio::test]
    async fn open_pr_without_integration_is_provider_error() {
        let (_dir, registry, ctx) = setup_repo();
        let trace = registry
            .invoke("git", "open_pr", &ctx, &json!({"title": "t"}))
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ProviderError);
    }

    #[tokio::test]
    async fn non_repo_workspace_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolDomainRegistry::new().register(Arc::new(GitDomain::new(Arc::new(
            StaticCredentialResolver::new(),
        ))));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");

        let trace = registry
            .invoke("git", "commit", &ctx, &json!({"message": "x"}))
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn cherry_pick_applies_commit() {
        let (dir, registry, ctx) = setup_repo();
        registry
            .invoke("git", "commit", &ctx, &json!({"message": "initial"}))
            .await;

        // Create a side branch with a new file, then pick it back onto main.
        registry
            .invoke("git", "branch", &ctx, &json!({"name": "side"}))
            .await;
        registry
            .invoke("git", "checkout", &ctx, &json!({"name": "side"}))
            .await;
        std::fs::write(dir.path().join("side.txt"), "side change\n").unwrap();
        let trace = registry
            .invoke("git", "commit", &ctx, &json!({"message": "side change"}))
            .await;
        let side_sha = trace.data.unwrap()["sha"].as_str().unwrap().to_string();

        let main_branch = {
            let repo = Repository::open(dir.path()).unwrap();
            // Repository::init default branch name varies; read it back.
            repo.branches(Some(BranchType::Local))
                .unwrap()
                .flatten()
                .map(|(b, _)| b.name().unwrap().unwrap().to_string())
                .find(|name| name != "side")
                .unwrap()
        };
        registry
            .invoke("git", "checkout", &ctx, &json!({"name": main_branch}))
            .await;
        assert!(!dir.path().join("side.txt").exists());

        let trace = registry
            .invoke("git", "cherry_pick", &ctx, &json!({"commit": side_sha}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(dir.path().join("side.txt").exists());
    }
}
