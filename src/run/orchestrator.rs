//! Run orchestrator.
//!
//! One coordinator advances any number of runs. Within a run, activation
//! processing is serialized behind the execution lock while dispatches for
//! concurrently activated nodes run as parallel tasks, bounded by a global
//! fairness semaphore. Control flags (stop, force cancel) live outside the
//! execution lock so `stop` never waits on a tick in progress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use llmctl_contract::{
    ErrorCode, ErrorEnvelope, ExecutionRequest, ExecutionStatus, NodeExecution, SandboxPaths,
};

use super::activation::{ActivationState, RunOutcome};
use super::input::assemble_input;
use super::routing::parse_routing_state;
use super::state::{
    Artifact, ArtifactKind, FlowchartRun, FlowchartRunNode, NodeStatus, RetentionMode, RunStatus,
    TriggerKind,
};
use crate::credentials::{CredentialResolver, McpIntegrationResolver};
use crate::dispatch::{DispatchDisposition, DispatchEvent, DispatchReport, DispatchTicket, NodeDispatcher};
use crate::errors::OrchestratorError;
use crate::flowchart::{Flowchart, FlowchartGraph, NodeIndex, NodeType};
use crate::instructions::{
    AdapterRegistry, InstructionCompiler, InstructionSource, ProviderDescriptor, ProviderFamily,
    RunMode,
};
use crate::realtime::{OutboxPublisher, StagedEvent, event_type, room_node, stream_node};
use crate::settings::SettingsProvider;
use crate::store::Store;

/// Stop mode for [`RunOrchestrator::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Block new activations; in-flight dispatches run to completion.
    Graceful,
    /// Additionally cancel in-flight dispatches.
    Force,
}

/// One `tick` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The run still has work in flight or pending.
    Working,
    /// The run reached a terminal status.
    Terminal(RunStatus),
}

/// Orchestrator-level configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root under which per-run sandbox workspaces are materialized.
    pub workspaces_root: PathBuf,
    /// Global ceiling on concurrently running dispatches across all runs.
    pub max_dispatch_concurrency: usize,
    /// Tenant-default instruction source; nodes may override bodies via
    /// configuration.
    pub instruction_source: InstructionSource,
}

impl OrchestratorConfig {
    /// Config rooted at the given workspace directory.
    pub fn new(workspaces_root: impl Into<PathBuf>, instruction_source: InstructionSource) -> Self {
        Self {
            workspaces_root: workspaces_root.into(),
            max_dispatch_concurrency: 16,
            instruction_source,
        }
    }
}

/// Mutable per-run state, serialized behind one lock.
struct RunExecution {
    graph: FlowchartGraph,
    activation: ActivationState,
    /// Succeeded nodes' output state.
    outputs: HashMap<NodeIndex, Value>,
    /// Activated node -> its run-node record id.
    records: HashMap<NodeIndex, String>,
    /// Nodes with a dispatch task in flight.
    in_flight: HashMap<NodeIndex, String>,
    result_tx: mpsc::Sender<(NodeIndex, DispatchReport)>,
    result_rx: mpsc::Receiver<(NodeIndex, DispatchReport)>,
    /// Soft warnings (MCP resolution etc.) surfaced in run metadata.
    warnings: Vec<String>,
    doomed: bool,
    settings: Arc<crate::settings::NodeExecutorSettings>,
    cutover: bool,
    trigger: TriggerKind,
    request_id: String,
    correlation_id: String,
}

/// Control surface reachable without the execution lock.
struct RunControl {
    stopping: AtomicBool,
    force: AtomicBool,
    cancel: CancellationToken,
    /// run_node_id -> job name, filled as dispatches are submitted.
    job_names: DashMap<String, String>,
}

struct RunHandle {
    control: Arc<RunControl>,
    exec: Arc<Mutex<RunExecution>>,
}

/// Coordinates execution of flowchart runs.
pub struct RunOrchestrator {
    store: Arc<Store>,
    dispatcher: Arc<dyn NodeDispatcher>,
    publisher: Arc<OutboxPublisher>,
    settings: Arc<SettingsProvider>,
    credentials: Arc<dyn CredentialResolver>,
    config: OrchestratorConfig,
    runs: DashMap<String, Arc<RunHandle>>,
    fairness: Arc<Semaphore>,
}

impl RunOrchestrator {
    /// Build an orchestrator over its collaborators.
    pub fn new(
        store: Arc<Store>,
        dispatcher: Arc<dyn NodeDispatcher>,
        publisher: Arc<OutboxPublisher>,
        settings: Arc<SettingsProvider>,
        credentials: Arc<dyn CredentialResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        let fairness = Arc::new(Semaphore::new(config.max_dispatch_concurrency.max(1)));
        Self {
            store,
            dispatcher,
            publisher,
            settings,
            credentials,
            config,
            runs: DashMap::new(),
            fairness,
        }
    }

    /// Create a queued run for a flowchart. The graph is validated before
    /// anything persists.
    pub fn create_run(
        &self,
        flowchart: &Flowchart,
        trigger_kind: TriggerKind,
        request_id: impl Into<String>,
    ) -> Result<FlowchartRun, OrchestratorError> {
        FlowchartGraph::compile(flowchart)?;
        let settings = self.settings.snapshot();
        let run = FlowchartRun {
            run_id: format!("run-{}", Uuid::new_v4()),
            flowchart_snapshot_id: flowchart.id.clone(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            trigger_kind,
            request_id: request_id.into(),
            correlation_id: format!("corr-{}", Uuid::new_v4()),
            runtime_cutover_enabled: settings.agent_runtime_cutover_enabled,
        };
        self.store.create_run(&run, flowchart, &[])?;
        info!(run_id = %run.run_id, flowchart = %flowchart.id, "run created");
        Ok(run)
    }

    /// Create a queued run for a quick "no-graph" trigger: the payload is
    /// wrapped into a single-task flowchart and takes the ordinary path.
    pub fn create_quick_run(
        &self,
        task_configuration: Value,
        request_id: impl Into<String>,
    ) -> Result<FlowchartRun, OrchestratorError> {
        let flowchart = Flowchart::quick(format!("quick-{}", Uuid::new_v4()), task_configuration);
        self.create_run(&flowchart, TriggerKind::Quick, request_id)
    }

    /// Transition `queued -> running` and set up the execution state.
    pub async fn start(&self, run_id: &str) -> Result<(), OrchestratorError> {
        if self.runs.contains_key(run_id) {
            return Err(OrchestratorError::AlreadyRunning {
                run_id: run_id.to_string(),
            });
        }
        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::Queued {
            return Err(OrchestratorError::NotStartable {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let flowchart = self.store.get_run_flowchart(run_id)?;
        let graph = FlowchartGraph::compile(&flowchart)?;
        let activation = ActivationState::new(&graph);
        let (result_tx, result_rx) = mpsc::channel(64);

        let handle = Arc::new(RunHandle {
            control: Arc::new(RunControl {
                stopping: AtomicBool::new(false),
                force: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                job_names: DashMap::new(),
            }),
            exec: Arc::new(Mutex::new(RunExecution {
                graph,
                activation,
                outputs: HashMap::new(),
                records: HashMap::new(),
                in_flight: HashMap::new(),
                result_tx,
                result_rx,
                warnings: Vec::new(),
                doomed: false,
                settings: self.settings.snapshot(),
                cutover: run.runtime_cutover_enabled,
                trigger: run.trigger_kind,
                request_id: run.request_id.clone(),
                correlation_id: run.correlation_id.clone(),
            })),
        });
        // Claim the exclusive run lock before any observable transition.
        match self.runs.entry(run_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyRunning {
                    run_id: run_id.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle);
            }
        }

        self.store.update_run_status(
            run_id,
            RunStatus::Running,
            &[run_event(run_id, "started", json!({"status": "running"}))],
        )?;
        self.drain();
        info!(run_id, "run started");
        Ok(())
    }

    /// Pump one activation step.
    pub async fn tick(&self, run_id: &str) -> Result<TickOutcome, OrchestratorError> {
        let handle = self
            .runs
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let mut exec = handle.exec.lock().await;
        let control = &handle.control;

        let may_activate = !control.stopping.load(Ordering::SeqCst)
            && !control.force.load(Ordering::SeqCst)
            && !exec.doomed;
        if may_activate {
            for node in exec.activation.eligible(&exec.graph) {
                self.activate_node(run_id, &mut exec, control, node).await?;
            }
        }

        if exec.in_flight.is_empty() {
            let more_possible = may_activate && !exec.activation.eligible(&exec.graph).is_empty();
            if more_possible {
                return Ok(TickOutcome::Working);
            }
            let status = self.finalize(run_id, &exec, control)?;
            drop(exec);
            self.runs.remove(run_id);
            return Ok(TickOutcome::Terminal(status));
        }

        // Wait for one terminal dispatch and fold it in.
        if let Some((node, report)) = exec.result_rx.recv().await {
            self.process_report(run_id, &mut exec, node, report)?;
        }
        Ok(TickOutcome::Working)
    }

    /// Drive a run from `queued` to a terminal status.
    pub async fn run_until_terminal(&self, run_id: &str) -> Result<RunStatus, OrchestratorError> {
        self.start(run_id).await?;
        loop {
            match self.tick(run_id).await? {
                TickOutcome::Working => {}
                TickOutcome::Terminal(status) => return Ok(status),
            }
        }
    }

    /// Stop a run. Graceful blocks new activations and lets in-flight
    /// dispatches finish; force additionally cancels them.
    pub async fn stop(&self, run_id: &str, mode: StopMode) -> Result<(), OrchestratorError> {
        let handle = self
            .runs
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        handle.control.stopping.store(true, Ordering::SeqCst);
        self.store.update_run_status(
            run_id,
            RunStatus::Stopping,
            &[run_event(run_id, "stopping", json!({"mode": format!("{mode:?}").to_lowercase()}))],
        )?;
        self.drain();

        if mode == StopMode::Force {
            handle.control.force.store(true, Ordering::SeqCst);
            handle.control.cancel.cancel();
            for entry in handle.control.job_names.iter() {
                let dispatcher = Arc::clone(&self.dispatcher);
                let job_name = entry.value().clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.cancel(&job_name, true).await {
                        warn!(job = %job_name, error = %e, "force cancel of job failed");
                    }
                });
            }
        }
        info!(run_id, ?mode, "stop requested");
        Ok(())
    }

    /// Activate one node: persist its record, compile instructions, and
    /// spawn the dispatch task. Start/end markers are structural and never
    /// get records.
    async fn activate_node(
        &self,
        run_id: &str,
        exec: &mut RunExecution,
        control: &Arc<RunControl>,
        node_index: NodeIndex,
    ) -> Result<(), OrchestratorError> {
        let node = exec.graph.node(node_index).clone();
        if node.node_type == NodeType::End {
            exec.activation.mark_succeeded(&exec.graph, node_index, &[]);
            return Ok(());
        }

        let run_node_id = format!("{run_id}--{}", node.id);
        let record = FlowchartRunNode::activated(
            &run_node_id,
            run_id,
            &node.id,
            node.node_type,
            0,
            workspace_identity(run_id),
        );
        self.store.insert_run_node(
            &record,
            &[node_stream_event(&run_node_id, "queued", &node.id)],
        )?;
        self.drain();
        exec.activation.mark_active(node_index);
        exec.records.insert(node_index, run_node_id.clone());

        // Strict decision contract: reject an unconfigured decision node
        // before any dispatch happens.
        if exec.cutover
            && node.node_type == NodeType::Decision
            && node.decision_conditions.is_empty()
        {
            let error = ErrorEnvelope::new(
                ErrorCode::ValidationError,
                format!("decision node '{}' declares no decision_conditions", node.id),
            );
            self.persist_node_failure(run_id, exec, node_index, &run_node_id, &error, true)?;
            return Ok(());
        }

        // Compile and materialize the instruction package.
        let provider = provider_descriptor(&node);
        let source = resolve_instruction_source(&self.config.instruction_source, &node);
        let run_mode = match exec.trigger {
            TriggerKind::Autorun => RunMode::Autorun,
            _ => RunMode::Manual,
        };
        let workspace_root = self.config.workspaces_root.join(run_id);
        let package = match InstructionCompiler::compile(&source, run_mode, &provider) {
            Ok(package) => package,
            Err(e) => {
                let error = ErrorEnvelope::new(ErrorCode::ValidationError, e.to_string());
                self.persist_node_failure(
                    run_id,
                    exec,
                    node_index,
                    &run_node_id,
                    &error,
                    !node.on_failure_continue,
                )?;
                return Ok(());
            }
        };
        if let Err(e) = std::fs::create_dir_all(&workspace_root) {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "cannot create workspace root {}: {e}",
                workspace_root.display()
            )));
        }
        InstructionCompiler::materialize(&package, &workspace_root)?;
        let adapter = AdapterRegistry::for_family(provider.family);
        let adapter_result = adapter.materialize(&package, &workspace_root)?;
        self.store.set_node_instruction_meta(
            &run_node_id,
            &package.package_hash,
            adapter_result.mode,
            Some(&source.agent_id),
            Some(&source.role_id),
        )?;

        // Credential bundle from the node's MCP selection.
        let integrations =
            McpIntegrationResolver::resolve(&node.mcp_server_keys, self.credentials.as_ref());
        exec.warnings.extend(integrations.warnings.clone());

        let assembled = assemble_input(&exec.graph, node_index, &exec.outputs);
        let execution = NodeExecution {
            configuration: node.configuration.clone(),
            input_context: assembled.context,
            attachments: assembled.attachments,
            enabled_providers: node.enabled_providers.clone(),
            default_model_id: node.default_model_id.clone(),
            mcp_server_keys: node.mcp_server_keys.clone(),
            sandbox: SandboxPaths::for_workspace("/workspace"),
        };
        let request = ExecutionRequest::v1(
            exec.request_id.clone(),
            format!("{run_node_id}#0"),
            node.id.clone(),
            node.node_type.as_str(),
            exec.settings.execution_timeout_seconds,
            execution,
        );
        let ticket = DispatchTicket {
            run_id: run_id.to_string(),
            run_node_id: run_node_id.clone(),
            attempt_index: 0,
            workspace_identity: workspace_identity(run_id),
            runtime_class: node.runtime_class,
            request,
            env: integrations.as_env(),
        };

        exec.in_flight.insert(node_index, run_node_id.clone());
        info!(
            run_id,
            node = %node.id,
            %run_node_id,
            correlation_id = %exec.correlation_id,
            "node activated"
        );
        self.spawn_dispatch(run_id, node_index, run_node_id, ticket, exec, control);
        Ok(())
    }

    /// Spawn the parallel dispatch task for one activated node.
    fn spawn_dispatch(
        &self,
        run_id: &str,
        node_index: NodeIndex,
        run_node_id: String,
        ticket: DispatchTicket,
        exec: &RunExecution,
        control: &Arc<RunControl>,
    ) {
        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let dispatcher = Arc::clone(&self.dispatcher);
        let fairness = Arc::clone(&self.fairness);
        let result_tx = exec.result_tx.clone();
        let cancel = control.cancel.child_token();
        let control = Arc::clone(control);
        let run_id = run_id.to_string();
        let node_id = ticket.request.node_id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = fairness.acquire_owned().await else {
                return;
            };
            let (event_tx, mut event_rx) = mpsc::channel::<DispatchEvent>(8);
            let dispatch = dispatcher.dispatch(ticket, event_tx, cancel);
            tokio::pin!(dispatch);

            let report = loop {
                tokio::select! {
                    report = &mut dispatch => break report,
                    Some(event) = event_rx.recv() => {
                        persist_dispatch_event(
                            &store, &publisher, &control, &run_id, &run_node_id, &node_id, event,
                        );
                    }
                }
            };
            // Milestones sent just before the report resolved are still in
            // the channel; persist them before handing the report over.
            while let Ok(event) = event_rx.try_recv() {
                persist_dispatch_event(
                    &store, &publisher, &control, &run_id, &run_node_id, &node_id, event,
                );
            }
            if result_tx.send((node_index, report)).await.is_err() {
                warn!(%run_node_id, "run execution dropped before report delivery");
            }
        });
    }

    /// Fold one terminal dispatch report into run state.
    fn process_report(
        &self,
        run_id: &str,
        exec: &mut RunExecution,
        node_index: NodeIndex,
        report: DispatchReport,
    ) -> Result<(), OrchestratorError> {
        exec.in_flight.remove(&node_index);
        let node = exec.graph.node(node_index).clone();
        let run_node_id = exec
            .records
            .get(&node_index)
            .cloned()
            .unwrap_or_else(|| format!("{run_id}--{}", node.id));
        let fatal = !node.on_failure_continue;

        match report.disposition {
            DispatchDisposition::Completed => {
                let Some(result) = report.result else {
                    let error =
                        ErrorEnvelope::new(ErrorCode::Unknown, "completed dispatch without result");
                    self.persist_node_failure(run_id, exec, node_index, &run_node_id, &error, fatal)?;
                    return Ok(());
                };
                match result.status {
                    ExecutionStatus::Success => self.persist_node_success(
                        run_id,
                        exec,
                        node_index,
                        &run_node_id,
                        &node,
                        result.output_state.unwrap_or(Value::Null),
                        result.routing_state.unwrap_or(Value::Null),
                        report.pod_name.as_deref(),
                        report.terminal_reason.as_deref(),
                        fatal,
                    )?,
                    ExecutionStatus::Cancelled => {
                        self.persist_node_canceled(run_id, exec, node_index, &run_node_id)?;
                    }
                    _ => {
                        // Executor-reported failure; the typed error is
                        // preserved verbatim.
                        let error = result.error.unwrap_or_else(|| {
                            ErrorEnvelope::new(ErrorCode::Unknown, "executor reported no error")
                        });
                        self.persist_node_failure(
                            run_id,
                            exec,
                            node_index,
                            &run_node_id,
                            &error,
                            fatal,
                        )?;
                    }
                }
            }
            DispatchDisposition::DispatchFailed | DispatchDisposition::DispatchUncertain => {
                let uncertain = report.disposition == DispatchDisposition::DispatchUncertain;
                let error = report.error.unwrap_or_else(|| {
                    ErrorEnvelope::new(ErrorCode::DispatchError, "dispatch failed")
                });
                let failed_event = StagedEvent::on_run(
                    run_id,
                    event_type("flowchart", "node", "failed"),
                    "flowchart_run_node",
                    &run_node_id,
                    json!({
                        "node_id": node.id,
                        "status": "failed",
                        "dispatch_uncertain": uncertain,
                        "error": error,
                    }),
                )
                .also_in(room_node(&run_node_id));
                self.store.record_dispatch_failed(
                    &run_node_id,
                    uncertain,
                    &error,
                    report.terminal_reason.as_deref(),
                    &[failed_event],
                )?;
                self.drain();
                // Ambiguity is always fatal: a run with an uncertain node
                // can never complete.
                exec.activation.mark_failed(node_index, uncertain || fatal);
                if uncertain || fatal {
                    exec.doomed = true;
                }
            }
            DispatchDisposition::TimedOut => {
                let error = report.error.unwrap_or_else(|| {
                    ErrorEnvelope::new(ErrorCode::Timeout, "execution timed out")
                });
                self.persist_node_failure(run_id, exec, node_index, &run_node_id, &error, fatal)?;
            }
            DispatchDisposition::Canceled => {
                self.persist_node_canceled(run_id, exec, node_index, &run_node_id)?;
            }
            DispatchDisposition::Infra => {
                let error = report
                    .error
                    .unwrap_or_else(|| ErrorEnvelope::new(ErrorCode::InfraError, "infra failure"));
                self.persist_node_failure(run_id, exec, node_index, &run_node_id, &error, fatal)?;
            }
        }
        Ok(())
    }

    /// Persist a successful node, its artifact, and fire routing.
    #[allow(clippy::too_many_arguments)]
    fn persist_node_success(
        &self,
        run_id: &str,
        exec: &mut RunExecution,
        node_index: NodeIndex,
        run_node_id: &str,
        node: &crate::flowchart::Node,
        output_state: Value,
        routing_state: Value,
        pod_name: Option<&str>,
        terminal_reason: Option<&str>,
        fatal_on_bad_routing: bool,
    ) -> Result<(), OrchestratorError> {
        let routing = match parse_routing_state(&routing_state, node.node_type, exec.cutover) {
            Ok(routing) => routing,
            Err(error) => {
                self.persist_node_failure(
                    run_id,
                    exec,
                    node_index,
                    run_node_id,
                    &error,
                    fatal_on_bad_routing,
                )?;
                return Ok(());
            }
        };

        let succeeded_event = StagedEvent::on_run(
            run_id,
            event_type("flowchart", "node", "succeeded"),
            "flowchart_run_node",
            run_node_id,
            json!({"node_id": node.id, "status": "succeeded"}),
        )
        .also_in(room_node(run_node_id));
        self.store.record_node_result(
            run_node_id,
            NodeStatus::Succeeded,
            Some(&output_state),
            Some(&routing_state),
            None,
            pod_name,
            terminal_reason,
            &[succeeded_event],
        )?;

        let artifact = Artifact {
            artifact_id: format!("art-{}", Uuid::new_v4()),
            run_node_id: run_node_id.to_string(),
            kind: artifact_kind(node.node_type),
            payload: output_state.clone(),
            content_hash: content_hash(&output_state),
            created_at: Utc::now(),
            retention_mode: RetentionMode::Keep,
            retention_ttl_seconds: None,
            retention_max_count: None,
        };
        let artifact_event = StagedEvent {
            event_type: event_type("flowchart", "node_artifact", "persisted"),
            entity_kind: "artifact".to_string(),
            entity_id: artifact.artifact_id.clone(),
            sequence_stream: stream_node(run_node_id),
            room_keys: vec![room_node(run_node_id)],
            payload: json!({"kind": artifact.kind, "content_hash": artifact.content_hash}),
        };
        self.store.insert_artifact(&artifact, &[artifact_event])?;
        self.drain();

        exec.outputs.insert(node_index, output_state);
        exec.activation
            .mark_succeeded(&exec.graph, node_index, &routing.matched_connector_ids);
        Ok(())
    }

    /// Persist a failed node and doom the run when fatal.
    fn persist_node_failure(
        &self,
        run_id: &str,
        exec: &mut RunExecution,
        node_index: NodeIndex,
        run_node_id: &str,
        error: &ErrorEnvelope,
        fatal: bool,
    ) -> Result<(), OrchestratorError> {
        let node_id = exec.graph.node(node_index).id.clone();
        let failed_event = StagedEvent::on_run(
            run_id,
            event_type("flowchart", "node", "failed"),
            "flowchart_run_node",
            run_node_id,
            json!({"node_id": node_id, "status": "failed", "error": error}),
        )
        .also_in(room_node(run_node_id));
        self.store.record_node_result(
            run_node_id,
            NodeStatus::Failed,
            None,
            None,
            Some(error),
            None,
            None,
            &[failed_event],
        )?;
        self.drain();
        exec.activation.mark_failed(node_index, fatal);
        if fatal {
            exec.doomed = true;
        }
        Ok(())
    }

    fn persist_node_canceled(
        &self,
        run_id: &str,
        exec: &mut RunExecution,
        node_index: NodeIndex,
        run_node_id: &str,
    ) -> Result<(), OrchestratorError> {
        let node_id = exec.graph.node(node_index).id.clone();
        let error = ErrorEnvelope::new(ErrorCode::Cancelled, "node execution cancelled");
        let canceled_event = StagedEvent::on_run(
            run_id,
            event_type("flowchart", "node", "canceled"),
            "flowchart_run_node",
            run_node_id,
            json!({"node_id": node_id, "status": "canceled"}),
        )
        .also_in(room_node(run_node_id));
        self.store.record_node_result(
            run_node_id,
            NodeStatus::Canceled,
            None,
            None,
            Some(&error),
            None,
            None,
            &[canceled_event],
        )?;
        self.drain();
        exec.activation.mark_canceled(node_index);
        Ok(())
    }

    /// Compute and persist the run's terminal status.
    fn finalize(
        &self,
        run_id: &str,
        exec: &RunExecution,
        control: &Arc<RunControl>,
    ) -> Result<RunStatus, OrchestratorError> {
        let outcome = exec.activation.outcome();
        let status = if control.force.load(Ordering::SeqCst) || outcome == RunOutcome::Canceled {
            RunStatus::Canceled
        } else if exec.doomed || outcome == RunOutcome::Failed {
            RunStatus::Failed
        } else if control.stopping.load(Ordering::SeqCst) {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };
        let action = match status {
            RunStatus::Completed => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Stopped => "stopped",
            _ => "updated",
        };
        self.store.update_run_status(
            run_id,
            status,
            &[run_event(
                run_id,
                action,
                json!({"status": status.as_str(), "warnings": exec.warnings.clone()}),
            )],
        )?;
        self.drain();
        info!(run_id, status = %status, "run finalized");
        Ok(status)
    }

    /// Publish committed outbox rows; drain failures are logged, never
    /// fatal (the outbox redelivers).
    fn drain(&self) {
        if let Err(e) = self.publisher.drain() {
            error!(error = %e, "outbox drain failed");
        }
    }
}

/// Persist one dispatch milestone from a dispatch task.
fn persist_dispatch_event(
    store: &Arc<Store>,
    publisher: &Arc<OutboxPublisher>,
    control: &Arc<RunControl>,
    run_id: &str,
    run_node_id: &str,
    node_id: &str,
    event: DispatchEvent,
) {
    let persisted = match event {
        DispatchEvent::Submitted {
            provider_dispatch_id,
            job_name,
        } => {
            control
                .job_names
                .insert(run_node_id.to_string(), job_name.clone());
            store
                .record_dispatch_submitted(
                    run_node_id,
                    &provider_dispatch_id,
                    &job_name,
                    &[node_stream_event(run_node_id, "dispatch_submitted", node_id)],
                )
                .map(|_| ())
        }
        DispatchEvent::Confirmed { pod_name } => {
            let started = StagedEvent::on_run(
                run_id,
                event_type("flowchart", "node", "started"),
                "flowchart_run_node",
                run_node_id,
                json!({"node_id": node_id, "status": "running"}),
            )
            .also_in(room_node(run_node_id));
            store.record_dispatch_confirmed(run_node_id, pod_name.as_deref(), &[started])
        }
    };
    match persisted {
        Ok(()) => {
            if let Err(e) = publisher.drain() {
                error!(%run_node_id, error = %e, "outbox drain failed");
            }
        }
        Err(e) => error!(%run_node_id, error = %e, "cannot persist dispatch milestone"),
    }
}

/// Stable logical workspace key for a run.
fn workspace_identity(run_id: &str) -> String {
    format!("ws-{run_id}")
}

fn run_event(run_id: &str, action: &str, payload: Value) -> StagedEvent {
    StagedEvent::on_run(
        run_id,
        event_type("flowchart", "run", action),
        "flowchart_run",
        run_id,
        payload,
    )
}

fn node_stream_event(run_node_id: &str, action: &str, node_id: &str) -> StagedEvent {
    StagedEvent {
        event_type: event_type("flowchart", "node", action),
        entity_kind: "flowchart_run_node".to_string(),
        entity_id: run_node_id.to_string(),
        sequence_stream: stream_node(run_node_id),
        room_keys: vec![room_node(run_node_id)],
        payload: json!({"node_id": node_id}),
    }
}

fn artifact_kind(node_type: NodeType) -> ArtifactKind {
    match node_type {
        NodeType::Plan => ArtifactKind::Plan,
        NodeType::Memory => ArtifactKind::Memory,
        NodeType::Milestone => ArtifactKind::Milestone,
        NodeType::Decision => ArtifactKind::Decision,
        NodeType::Rag => ArtifactKind::RagQuery,
        _ => ArtifactKind::Generic,
    }
}

fn content_hash(payload: &Value) -> String {
    hex::encode(Sha256::digest(payload.to_string().as_bytes()))
}

/// Map a node's first enabled provider onto an adapter family.
fn provider_descriptor(node: &crate::flowchart::Node) -> ProviderDescriptor {
    let id = node
        .enabled_providers
        .first()
        .cloned()
        .unwrap_or_else(|| "claude".to_string());
    let family = match id.as_str() {
        "claude" => ProviderFamily::Claude,
        "codex" | "openai" => ProviderFamily::Codex,
        "gemini" => ProviderFamily::Gemini,
        _ => ProviderFamily::Generic,
    };
    ProviderDescriptor { id, family }
}

/// Apply node-level body overrides onto the tenant-default source.
fn resolve_instruction_source(
    default: &InstructionSource,
    node: &crate::flowchart::Node,
) -> InstructionSource {
    let mut source = default.clone();
    if let Some(role_body) = node.configuration.get("role_body").and_then(Value::as_str) {
        source.role_body = role_body.to_string();
    }
    if let Some(agent_body) = node.configuration.get("agent_body").and_then(Value::as_str) {
        source.agent_body = agent_body.to_string();
    }
    source
}
