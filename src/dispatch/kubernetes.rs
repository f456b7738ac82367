//! Kubernetes Job dispatcher.
//!
//! One ephemeral Job per ticket: submit, wait for the startup marker on
//! the pod's log stream, wait for the terminal Job state, then collect
//! logs and parse the executor's result line. Ambiguity is fail-closed:
//! if the marker never arrives, or the Job goes terminal before
//! confirmation, the attempt is reported `dispatch_uncertain` and never
//! retried here.

use std::sync::Arc;
use std::time::Duration;

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::runtime::wait::await_condition;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use llmctl_contract::{ErrorCode, ErrorEnvelope, extract_result_line, parse_startup_marker};

use super::job::{build_job, job_name, provider_dispatch_id};
use super::machine::DispatchMachine;
use super::{DispatchDisposition, DispatchEvent, DispatchReport, DispatchTicket, NodeDispatcher};
use crate::errors::DispatchError;
use crate::settings::NodeExecutorSettings;

/// Dispatcher over one Kubernetes cluster connection.
pub struct KubernetesDispatcher {
    client: kube::Client,
    settings: Arc<NodeExecutorSettings>,
}

impl KubernetesDispatcher {
    /// Connect using in-cluster configuration or the ambient kubeconfig.
    pub async fn connect(settings: Arc<NodeExecutorSettings>) -> Result<Self, DispatchError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| DispatchError::Kubeconfig(e.to_string()))?;
        Ok(Self { client, settings })
    }

    /// Dispatcher over an existing client (tests, custom auth).
    pub fn with_client(client: kube::Client, settings: Arc<NodeExecutorSettings>) -> Self {
        Self { client, settings }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.settings.k8s_namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.k8s_namespace)
    }

    /// Find the pod backing a Job, polling until it exists or the deadline
    /// passes.
    async fn find_pod(&self, job: &str, deadline: Duration) -> Option<String> {
        let pods = self.pods();
        let params = ListParams::default().labels(&format!("job-name={job}"));
        let poll = async {
            loop {
                if let Ok(list) = pods.list(&params).await
                    && let Some(pod) = list.items.first()
                    && let Some(name) = pod.metadata.name.clone()
                {
                    return name;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };
        tokio::time::timeout(deadline, poll).await.ok()
    }

    /// Scan the pod log stream for a valid startup marker.
    async fn await_marker(&self, pod: &str, deadline: Duration) -> MarkerOutcome {
        let pods = self.pods();
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let scan = async {
            let stream = match pods.log_stream(pod, &params).await {
                Ok(stream) => stream,
                Err(e) => return MarkerOutcome::StreamFailed(e.to_string()),
            };
            let mut lines = stream.lines();
            loop {
                match lines.try_next().await {
                    Ok(Some(line)) => {
                        if parse_startup_marker(&line).is_some() {
                            return MarkerOutcome::Confirmed;
                        }
                        // Invalid lines are ignored; keep scanning.
                    }
                    Ok(None) => return MarkerOutcome::StreamEnded,
                    Err(e) => return MarkerOutcome::StreamFailed(e.to_string()),
                }
            }
        };
        match tokio::time::timeout(deadline, scan).await {
            Ok(outcome) => outcome,
            Err(_) => MarkerOutcome::TimedOut,
        }
    }

    /// Wait for the Job to reach a terminal condition.
    async fn await_terminal(&self, job: &str, deadline: Duration) -> TerminalOutcome {
        let jobs = self.jobs();
        let condition = |obj: Option<&Job>| {
            obj.and_then(|job| job.status.as_ref())
                .map(|status| {
                    status.succeeded.unwrap_or(0) > 0 || status.failed.unwrap_or(0) > 0
                })
                .unwrap_or(false)
        };
        match tokio::time::timeout(deadline, await_condition(jobs, job, condition)).await {
            Ok(Ok(_)) => self.terminal_reason(job).await,
            Ok(Err(e)) => TerminalOutcome::WatchFailed(e.to_string()),
            Err(_) => TerminalOutcome::TimedOut,
        }
    }

    async fn terminal_reason(&self, job: &str) -> TerminalOutcome {
        match self.jobs().get(job).await {
            Ok(found) => {
                let status = found.status.unwrap_or_default();
                if status.succeeded.unwrap_or(0) > 0 {
                    TerminalOutcome::Finished("Complete".to_string())
                } else {
                    let reason = status
                        .conditions
                        .unwrap_or_default()
                        .into_iter()
                        .find(|c| c.type_ == "Failed")
                        .and_then(|c| c.reason)
                        .unwrap_or_else(|| "Failed".to_string());
                    TerminalOutcome::Finished(reason)
                }
            }
            Err(e) => TerminalOutcome::WatchFailed(e.to_string()),
        }
    }

    /// Collect the pod's full log within the collection window.
    async fn collect_logs(&self, pod: &str) -> Result<String, String> {
        let params = LogParams::default();
        let window = Duration::from_secs(self.settings.log_collection_timeout_seconds);
        match tokio::time::timeout(window, self.pods().logs(pod, &params)).await {
            Ok(Ok(logs)) => Ok(logs),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "log collection exceeded {}s",
                self.settings.log_collection_timeout_seconds
            )),
        }
    }

    fn interpret_logs(&self, logs: &str) -> DispatchReport {
        let violation = match extract_result_line(logs) {
            Ok(result) => match result.validate() {
                Ok(()) => return DispatchReport::completed(result),
                Err(violation) => violation,
            },
            Err(violation) => violation,
        };
        // Version mismatch and any other contract breakage classify the
        // same way: the executor infrastructure is broken, not the node.
        DispatchReport::failed(
            DispatchDisposition::Infra,
            ErrorEnvelope::new(ErrorCode::InfraError, violation.to_string()),
        )
    }
}

enum MarkerOutcome {
    Confirmed,
    TimedOut,
    StreamEnded,
    StreamFailed(String),
}

enum TerminalOutcome {
    Finished(String),
    TimedOut,
    WatchFailed(String),
}

#[async_trait::async_trait]
impl NodeDispatcher for KubernetesDispatcher {
    async fn dispatch(
        &self,
        ticket: DispatchTicket,
        events: mpsc::Sender<DispatchEvent>,
        cancel: CancellationToken,
    ) -> DispatchReport {
        let job = match build_job(&ticket, &self.settings) {
            Ok(job) => job,
            Err(e) => {
                return DispatchReport::failed(
                    DispatchDisposition::DispatchFailed,
                    ErrorEnvelope::new(ErrorCode::ValidationError, e.to_string()),
                );
            }
        };
        let name = job_name(&ticket.run_node_id, ticket.attempt_index);
        let dispatch_id = provider_dispatch_id(&name);
        let mut machine = DispatchMachine::new(&ticket.run_node_id, ticket.attempt_index);

        // Submit. A 409 means this attempt was already submitted; adopt the
        // existing Job instead of creating a second execution.
        match self.jobs().create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(job = %name, run_node_id = %ticket.run_node_id, "job submitted");
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                debug!(job = %name, "job already exists; adopting existing dispatch");
            }
            Err(e) => {
                return DispatchReport::failed(
                    DispatchDisposition::DispatchFailed,
                    ErrorEnvelope::new(
                        ErrorCode::DispatchError,
                        format!("job submission failed: {e}"),
                    ),
                );
            }
        }
        if let Err(e) = machine.submitted(&dispatch_id) {
            return DispatchReport::failed(
                DispatchDisposition::DispatchFailed,
                ErrorEnvelope::new(ErrorCode::DispatchError, e.to_string()),
            );
        }
        let _ = events
            .send(DispatchEvent::Submitted {
                provider_dispatch_id: dispatch_id.clone(),
                job_name: name.clone(),
            })
            .await;

        // Startup marker within the dispatch window, fail-closed.
        let dispatch_window = Duration::from_secs(self.settings.dispatch_timeout_seconds);
        let Some(pod_name) = self.find_pod(&name, dispatch_window).await else {
            warn!(job = %name, "no pod appeared within the dispatch window");
            return DispatchReport::uncertain(format!(
                "no pod for job '{name}' within {}s",
                self.settings.dispatch_timeout_seconds
            ));
        };

        let marker = tokio::select! {
            outcome = self.await_marker(&pod_name, dispatch_window) => outcome,
            () = cancel.cancelled() => {
                return DispatchReport::failed(
                    DispatchDisposition::Canceled,
                    ErrorEnvelope::new(ErrorCode::Cancelled, "dispatch cancelled before confirmation"),
                )
                .with_pod_name(pod_name);
            }
        };
        match marker {
            MarkerOutcome::Confirmed => {
                if let Err(e) = machine.confirmed() {
                    return DispatchReport::uncertain(e.to_string()).with_pod_name(pod_name);
                }
                let _ = events
                    .send(DispatchEvent::Confirmed {
                        pod_name: Some(pod_name.clone()),
                    })
                    .await;
            }
            MarkerOutcome::TimedOut => {
                return DispatchReport::uncertain(format!(
                    "no startup marker within {}s",
                    self.settings.dispatch_timeout_seconds
                ))
                .with_pod_name(pod_name);
            }
            MarkerOutcome::StreamEnded => {
                // Terminal before confirmation with no valid marker seen.
                return DispatchReport::uncertain("executor ended before emitting a startup marker")
                    .with_pod_name(pod_name);
            }
            MarkerOutcome::StreamFailed(message) => {
                return DispatchReport::uncertain(format!("log stream failed pre-marker: {message}"))
                    .with_pod_name(pod_name);
            }
        }

        // Terminal Job state within the execution budget.
        let execution_window = Duration::from_secs(self.settings.execution_timeout_seconds);
        let terminal = tokio::select! {
            outcome = self.await_terminal(&name, execution_window) => outcome,
            () = cancel.cancelled() => {
                return DispatchReport::failed(
                    DispatchDisposition::Canceled,
                    ErrorEnvelope::new(ErrorCode::Cancelled, "execution cancelled"),
                )
                .with_pod_name(pod_name);
            }
        };
        let reason = match terminal {
            TerminalOutcome::Finished(reason) => reason,
            TerminalOutcome::TimedOut => {
                return DispatchReport::failed(
                    DispatchDisposition::TimedOut,
                    ErrorEnvelope::new(
                        ErrorCode::Timeout,
                        format!(
                            "no terminal job state within {}s",
                            self.settings.execution_timeout_seconds
                        ),
                    ),
                )
                .with_pod_name(pod_name);
            }
            TerminalOutcome::WatchFailed(message) => {
                // The dispatch is already confirmed; a broken watch is an
                // infrastructure failure, not dispatch ambiguity.
                return DispatchReport::failed(
                    DispatchDisposition::Infra,
                    ErrorEnvelope::new(
                        ErrorCode::InfraError,
                        format!("job watch failed: {message}"),
                    ),
                )
                .with_pod_name(pod_name);
            }
        };

        // Collect logs and parse the result contract.
        let logs = match self.collect_logs(&pod_name).await {
            Ok(logs) => logs,
            Err(message) => {
                return DispatchReport::failed(
                    DispatchDisposition::Infra,
                    ErrorEnvelope::new(
                        ErrorCode::InfraError,
                        format!("cannot collect executor logs: {message}"),
                    ),
                )
                .with_pod_name(pod_name)
                .with_terminal_reason(reason);
            }
        };
        self.interpret_logs(&logs)
            .with_pod_name(pod_name)
            .with_terminal_reason(reason)
    }

    async fn cancel(&self, job_name: &str, force: bool) -> Result<(), DispatchError> {
        if force && !self.settings.cancel_force_kill_enabled {
            return Err(DispatchError::JobApi(
                "force cancel is disabled by settings".to_string(),
            ));
        }
        if !force {
            // Grace window before the background delete.
            tokio::time::sleep(Duration::from_secs(
                self.settings.cancel_grace_timeout_seconds,
            ))
            .await;
        }
        let params = DeleteParams {
            propagation_policy: Some(if force {
                PropagationPolicy::Foreground
            } else {
                PropagationPolicy::Background
            }),
            ..Default::default()
        };
        self.jobs()
            .delete(job_name, &params)
            .await
            .map_err(|e| DispatchError::JobApi(format!("job delete failed: {e}")))?;
        info!(job = %job_name, force, "job cancelled");
        Ok(())
    }
}
