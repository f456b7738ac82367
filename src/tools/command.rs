//! Command execution domain.
//!
//! `run` executes one bounded command; sessions give a shell with pipe
//! stdin/stdout that survives across invocations; background jobs run
//! detached with their output buffered until collected. Everything runs
//! with the sandbox root as working directory and output capped by the
//! context limits.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use llmctl_contract::ErrorCode;

use super::{DomainOutcome, ToolDomain, ToolDomainContext};

/// The `command` tool domain.
pub struct CommandDomain {
    sessions: Mutex<HashMap<String, ShellSession>>,
    jobs: Mutex<HashMap<String, BackgroundJob>>,
}

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    /// Lines read off the session's stdout so far.
    output: Arc<Mutex<Vec<String>>>,
    /// Index of the first line not yet returned to the caller.
    cursor: usize,
}

struct BackgroundJob {
    handle: JoinHandle<(Option<i32>, String, String)>,
}

#[derive(Deserialize)]
struct RunArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct SessionStartArgs {
    #[serde(default)]
    shell: Option<String>,
}

#[derive(Deserialize)]
struct SessionSendArgs {
    session_id: String,
    input: String,
    /// How long to wait for output after sending, milliseconds.
    #[serde(default = "default_settle_ms")]
    settle_ms: u64,
}

fn default_settle_ms() -> u64 {
    200
}

#[derive(Deserialize)]
struct SessionIdArgs {
    session_id: String,
}

#[derive(Deserialize)]
struct JobIdArgs {
    job_id: String,
}

impl CommandDomain {
    /// Empty domain.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: RunArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let output = Command::new(&args.command)
            .args(&args.args)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let result = tokio::time::timeout(
            Duration::from_secs(ctx.limits.timeout_seconds),
            output,
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let (stdout, stdout_truncated) =
                    cap_output(&output.stdout, ctx.limits.max_output_bytes);
                let (stderr, stderr_truncated) =
                    cap_output(&output.stderr, ctx.limits.max_output_bytes);
                let exit_code = output.status.code().unwrap_or(-1);
                let mut outcome = DomainOutcome::ok()
                    .with_count("exit_code", exit_code.max(0) as u64)
                    .with_data(json!({
                        "exit_code": exit_code,
                        "stdout": stdout,
                        "stderr": stderr,
                    }));
                if stdout_truncated || stderr_truncated {
                    outcome = outcome.with_warning(format!(
                        "output truncated to {} bytes",
                        ctx.limits.max_output_bytes
                    ));
                }
                if !output.status.success() {
                    outcome = outcome.with_warning(format!(
                        "command '{}' exited with code {exit_code}",
                        args.command
                    ));
                }
                outcome
            }
            Ok(Err(e)) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("cannot run '{}': {e}", args.command),
            ),
            Err(_) => DomainOutcome::fail(
                ErrorCode::Timeout,
                format!(
                    "command '{}' exceeded {}s",
                    args.command, ctx.limits.timeout_seconds
                ),
            ),
        }
    }

    async fn session_start(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: SessionStartArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let shell = args.shell.unwrap_or_else(|| "sh".to_string());
        let mut child = match Command::new(&shell)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return DomainOutcome::fail(
                    ErrorCode::ExecutionError,
                    format!("cannot start shell '{shell}': {e}"),
                );
            }
        };

        let Some(stdin) = child.stdin.take() else {
            return DomainOutcome::fail(ErrorCode::ExecutionError, "shell stdin unavailable");
        };
        let Some(stdout) = child.stdout.take() else {
            return DomainOutcome::fail(ErrorCode::ExecutionError, "shell stdout unavailable");
        };

        let output = Arc::new(Mutex::new(Vec::new()));
        let reader_output = Arc::clone(&output);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reader_output.lock().await.push(line);
            }
        });

        let session_id = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(
            session_id.clone(),
            ShellSession {
                child,
                stdin,
                output,
                cursor: 0,
            },
        );
        DomainOutcome::ok().with_data(json!({"session_id": session_id}))
    }

    async fn session_send(&self, _ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: SessionSendArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&args.session_id) else {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown session '{}'", args.session_id),
            );
        };

        let line = format!("{}\n", args.input);
        if let Err(e) = session.stdin.write_all(line.as_bytes()).await {
            return DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("session write failed: {e}"),
            );
        }
        let _ = session.stdin.flush().await;

        tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;

        let buffered = session.output.lock().await;
        let fresh: Vec<String> = buffered[session.cursor.min(buffered.len())..].to_vec();
        let cursor = buffered.len();
        drop(buffered);
        session.cursor = cursor;

        DomainOutcome::ok()
            .with_count("lines", fresh.len() as u64)
            .with_data(json!({"output": fresh}))
    }

    async fn session_close(&self, _ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: SessionIdArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let Some(mut session) = self.sessions.lock().await.remove(&args.session_id) else {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown session '{}'", args.session_id),
            );
        };
        let _ = session.child.kill().await;
        DomainOutcome::ok().with_count("closed", 1)
    }

    async fn background_start(&self, ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: RunArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let workspace_root = ctx.workspace_root.clone();
        let max_bytes = ctx.limits.max_output_bytes;
        let command = args.command.clone();
        let handle = tokio::spawn(async move {
            let output = Command::new(&command)
                .args(&args.args)
                .current_dir(&workspace_root)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await;
            match output {
                Ok(output) => {
                    let (stdout, _) = cap_output(&output.stdout, max_bytes);
                    let (stderr, _) = cap_output(&output.stderr, max_bytes);
                    (output.status.code(), stdout, stderr)
                }
                Err(e) => (None, String::new(), format!("spawn failed: {e}")),
            }
        });

        let job_id = Uuid::new_v4().to_string();
        self.jobs
            .lock()
            .await
            .insert(job_id.clone(), BackgroundJob { handle });
        DomainOutcome::ok().with_data(json!({"job_id": job_id}))
    }

    async fn background_status(&self, _ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: JobIdArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let jobs = self.jobs.lock().await;
        let Some(job) = jobs.get(&args.job_id) else {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown background job '{}'", args.job_id),
            );
        };
        let state = if job.handle.is_finished() {
            "finished"
        } else {
            "running"
        };
        DomainOutcome::ok().with_data(json!({"state": state}))
    }

    async fn background_collect(&self, _ctx: &ToolDomainContext, payload: &Value) -> DomainOutcome {
        let args: JobIdArgs = match super::parse_payload(payload) {
            Ok(args) => args,
            Err(outcome) => return outcome,
        };
        let Some(job) = self.jobs.lock().await.remove(&args.job_id) else {
            return DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown background job '{}'", args.job_id),
            );
        };
        match job.handle.await {
            Ok((exit_code, stdout, stderr)) => DomainOutcome::ok().with_data(json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            })),
            Err(e) => DomainOutcome::fail(
                ErrorCode::ExecutionError,
                format!("background job panicked: {e}"),
            ),
        }
    }
}

impl Default for CommandDomain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDomain for CommandDomain {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(
        &self,
        operation: &str,
        ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "run" => self.run(ctx, payload).await,
            "session_start" => self.session_start(ctx, payload).await,
            "session_send" => self.session_send(ctx, payload).await,
            "session_close" => self.session_close(ctx, payload).await,
            "background_job_start" => self.background_start(ctx, payload).await,
            "background_job_status" => self.background_status(ctx, payload).await,
            "background_job_collect" => self.background_collect(ctx, payload).await,
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown command operation '{other}'"),
            ),
        }
    }
}

/// Lossy-decode and cap captured output.
fn cap_output(bytes: &[u8], max: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() > max {
        (text.chars().take(max).collect(), true)
    } else {
        (text.to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolDomainRegistry, TraceStatus};

    fn setup() -> (tempfile::TempDir, ToolDomainRegistry, ToolDomainContext) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolDomainRegistry::new().register(Arc::new(CommandDomain::new()));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");
        (dir, registry, ctx)
    }

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let (_dir, registry, ctx) = setup();
        let trace = registry
            .invoke(
                "command",
                "run",
                &ctx,
                &json!({"command": "echo", "args": ["hello"]}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let data = trace.data.unwrap();
        assert_eq!(data["exit_code"], 0);
        assert!(data["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn run_nonzero_exit_warns() {
        let (_dir, registry, ctx) = setup();
        let trace = registry
            .invoke(
                "command",
                "run",
                &ctx,
                &json!({"command": "sh", "args": ["-c", "exit 3"]}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Warning);
        assert_eq!(trace.data.unwrap()["exit_code"], 3);
    }

    #[tokio::test]
    async fn run_times_out() {
        let (_dir, registry, mut ctx) = setup();
        ctx.limits.timeout_seconds = 1;
        let trace = registry
            .invoke(
                "command",
                "run",
                &ctx,
                &json!({"command": "sleep", "args": ["30"]}),
            )
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn run_in_workspace_directory() {
        let (dir, registry, ctx) = setup();
        std::fs::write(dir.path().join("probe.txt"), "x").unwrap();
        let trace = registry
            .invoke("command", "run", &ctx, &json!({"command": "ls"}))
            .await;
        assert!(trace.data.unwrap()["stdout"]
            .as_str()
            .unwrap()
            .contains("probe.txt"));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let (_dir, registry, ctx) = setup();
        let trace = registry
            .invoke("command", "session_start", &ctx, &json!({}))
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let session_id = trace.data.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let trace = registry
            .invoke(
                "command",
                "session_send",
                &ctx,
                &json!({"session_id": session_id, "input": "echo in-session", "settle_ms": 500}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let output = trace.data.unwrap()["output"].to_string();
        assert!(output.contains("in-session"));

        let trace = registry
            .invoke(
                "command",
                "session_close",
                &ctx,
                &json!({"session_id": session_id}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);

        // Closed session is gone.
        let trace = registry
            .invoke(
                "command",
                "session_send",
                &ctx,
                &json!({"session_id": session_id, "input": "echo x"}),
            )
            .await;
        assert!(trace.is_error());
    }

    #[tokio::test]
    async fn background_job_lifecycle() {
        let (_dir, registry, ctx) = setup();
        let trace = registry
            .invoke(
                "command",
                "background_job_start",
                &ctx,
                &json!({"command": "echo", "args": ["done"]}),
            )
            .await;
        let job_id = trace.data.unwrap()["job_id"].as_str().unwrap().to_string();

        // Collect blocks until the job finishes and returns its output.
        let trace = registry
            .invoke(
                "command",
                "background_job_collect",
                &ctx,
                &json!({"job_id": job_id}),
            )
            .await;
        assert_eq!(trace.status, TraceStatus::Success);
        let data = trace.data.unwrap();
        assert_eq!(data["exit_code"], 0);
        assert!(data["stdout"].as_str().unwrap().contains("done"));

        // Collected job is gone.
        let trace = registry
            .invoke(
                "command",
                "background_job_status",
                &ctx,
                &json!({"job_id": job_id}),
            )
            .await;
        assert!(trace.is_error());
    }
}
