//! Transactional relational store.
//!
//! One SQLite database holds the canonical run/node/artifact state, the
//! event outbox, integration settings, and executor settings. Every state
//! transition is one transaction; the envelopes describing the transition
//! are staged into `event_outbox` inside that same transaction, so the
//! realtime layer can only ever observe committed state.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use llmctl_contract::ErrorEnvelope;

use crate::errors::StoreError;
use crate::flowchart::{Flowchart, NodeType};
use crate::realtime::{CONTRACT_VERSION, EventEnvelope, StagedEvent};
use crate::run::state::{
    AdapterMode, Artifact, ArtifactKind, DispatchStatus, FlowchartRun, FlowchartRunNode,
    NodeStatus, RetentionMode, RunStatus, TriggerKind,
};
use crate::settings::NodeExecutorSettings;

/// Deserialize a unit enum from its wire string.
fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

/// Serialize an optional JSON column.
fn json_opt(v: &Option<Value>) -> Result<Option<String>, StoreError> {
    v.as_ref()
        .map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

/// SQLite-backed store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS flowchart_runs (
                run_id TEXT PRIMARY KEY,
                flowchart_snapshot_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                started_at TEXT,
                finished_at TEXT,
                trigger_kind TEXT NOT NULL,
                request_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                runtime_cutover_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flowchart_run_nodes (
                run_node_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES flowchart_runs(run_id) ON DELETE CASCADE,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                attempt_index INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                dispatch_status TEXT NOT NULL DEFAULT 'dispatch_pending',
                dispatch_uncertain INTEGER NOT NULL DEFAULT 0,
                provider_dispatch_id TEXT,
                k8s_job_name TEXT,
                k8s_pod_name TEXT,
                k8s_terminal_reason TEXT,
                workspace_identity TEXT NOT NULL,
                selected_provider TEXT NOT NULL DEFAULT 'kubernetes',
                final_provider TEXT,
                output_state TEXT,
                routing_state TEXT,
                error TEXT,
                instruction_manifest_hash TEXT,
                instruction_adapter_mode TEXT,
                resolved_agent_id TEXT,
                resolved_role_id TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT,
                UNIQUE(run_id, node_id, attempt_index),
                CHECK (dispatch_status NOT IN ('dispatch_submitted', 'dispatch_confirmed')
                       OR provider_dispatch_id IS NOT NULL),
                CHECK (dispatch_uncertain = 0 OR status = 'failed')
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_run_nodes_dispatch_id
                ON flowchart_run_nodes(provider_dispatch_id)
                WHERE provider_dispatch_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_run_nodes_run
                ON flowchart_run_nodes(run_id);

            CREATE TABLE IF NOT EXISTS flowchart_run_node_artifacts (
                artifact_id TEXT PRIMARY KEY,
                run_node_id TEXT NOT NULL
                    REFERENCES flowchart_run_nodes(run_node_id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retention_mode TEXT NOT NULL DEFAULT 'keep',
                retention_ttl_seconds INTEGER,
                retention_max_count INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_node
                ON flowchart_run_node_artifacts(run_node_id);

            CREATE TABLE IF NOT EXISTS event_outbox (
                event_id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL,
                sequence_stream TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                emitted_at TEXT NOT NULL,
                event_type TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                room_keys TEXT NOT NULL,
                payload TEXT NOT NULL,
                contract_version TEXT NOT NULL,
                published INTEGER NOT NULL DEFAULT 0,
                UNIQUE(sequence_stream, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_unpublished
                ON event_outbox(published, sequence_stream, sequence);

            CREATE TABLE IF NOT EXISTS integration_settings (
                provider TEXT NOT NULL,
                key TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (provider, key)
            );

            CREATE TABLE IF NOT EXISTS node_executor_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Stage one event inside an open transaction, assigning the next
    /// sequence on its stream.
    fn stage_event(tx: &Transaction<'_>, event: &StagedEvent) -> Result<(), StoreError> {
        let sequence: u64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM event_outbox WHERE sequence_stream = ?1",
            params![event.sequence_stream],
            |row| row.get(0),
        )?;
        let idempotency_key =
            crate::realtime::idempotency_key(&event.event_type, &event.entity_id, sequence);
        tx.execute(
            "INSERT INTO event_outbox (
                event_id, idempotency_key, sequence_stream, sequence, emitted_at,
                event_type, entity_kind, entity_id, room_keys, payload, contract_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                Uuid::new_v4().to_string(),
                idempotency_key,
                event.sequence_stream,
                sequence,
                Utc::now().to_rfc3339(),
                event.event_type,
                event.entity_kind,
                event.entity_id,
                serde_json::to_string(&event.room_keys)?,
                serde_json::to_string(&event.payload)?,
                CONTRACT_VERSION,
            ],
        )?;
        Ok(())
    }

    fn stage_events(tx: &Transaction<'_>, events: &[StagedEvent]) -> Result<(), StoreError> {
        for event in events {
            Self::stage_event(tx, event)?;
        }
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Create a queued run with its flowchart snapshot.
    pub fn create_run(
        &self,
        run: &FlowchartRun,
        flowchart: &Flowchart,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO flowchart_runs (
                run_id, flowchart_snapshot_id, snapshot, status, started_at, finished_at,
                trigger_kind, request_id, correlation_id, runtime_cutover_enabled, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id,
                run.flowchart_snapshot_id,
                serde_json::to_string(flowchart)?,
                run.status.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.trigger_kind.as_str(),
                run.request_id,
                run.correlation_id,
                run.runtime_cutover_enabled as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    /// Load a run record.
    pub fn get_run(&self, run_id: &str) -> Result<FlowchartRun, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, flowchart_snapshot_id, status, started_at, finished_at,
                    trigger_kind, request_id, correlation_id, runtime_cutover_enabled
             FROM flowchart_runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("flowchart_run", run_id))
        .and_then(|row| {
            Ok(FlowchartRun {
                run_id: row.0,
                flowchart_snapshot_id: row.1,
                status: enum_from_str::<RunStatus>(&row.2)?,
                started_at: parse_ts_opt(row.3)?,
                finished_at: parse_ts_opt(row.4)?,
                trigger_kind: enum_from_str::<TriggerKind>(&row.5)?,
                request_id: row.6,
                correlation_id: row.7,
                runtime_cutover_enabled: row.8 != 0,
            })
        })
    }

    /// Load the flowchart snapshot of a run.
    pub fn get_run_flowchart(&self, run_id: &str) -> Result<Flowchart, StoreError> {
        let conn = self.lock()?;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM flowchart_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let snapshot = snapshot.ok_or_else(|| StoreError::not_found("flowchart_run", run_id))?;
        Ok(serde_json::from_str(&snapshot)?)
    }

    /// Transition a run's status, stamping start/finish timestamps.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = match status {
            RunStatus::Running => tx.execute(
                "UPDATE flowchart_runs SET status = ?2, started_at = COALESCE(started_at, ?3)
                 WHERE run_id = ?1",
                params![run_id, status.as_str(), now],
            )?,
            s if s.is_terminal() => tx.execute(
                "UPDATE flowchart_runs SET status = ?2, finished_at = COALESCE(finished_at, ?3)
                 WHERE run_id = ?1",
                params![run_id, status.as_str(), now],
            )?,
            _ => tx.execute(
                "UPDATE flowchart_runs SET status = ?2 WHERE run_id = ?1",
                params![run_id, status.as_str()],
            )?,
        };
        if changed == 0 {
            return Err(StoreError::not_found("flowchart_run", run_id));
        }
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    // ── Run nodes ─────────────────────────────────────────────────────

    /// Insert a freshly activated node record.
    pub fn insert_run_node(
        &self,
        node: &FlowchartRunNode,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO flowchart_run_nodes (
                run_node_id, run_id, node_id, node_type, attempt_index, status,
                dispatch_status, dispatch_uncertain, provider_dispatch_id,
                k8s_job_name, k8s_pod_name, k8s_terminal_reason, workspace_identity,
                selected_provider, final_provider, output_state, routing_state, error,
                instruction_manifest_hash, instruction_adapter_mode,
                resolved_agent_id, resolved_role_id, created_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                node.run_node_id,
                node.run_id,
                node.node_id,
                node.node_type.as_str(),
                node.attempt_index,
                node.status.as_str(),
                node.dispatch_status.as_str(),
                node.dispatch_uncertain as i64,
                node.provider_dispatch_id,
                node.k8s_job_name,
                node.k8s_pod_name,
                node.k8s_terminal_reason,
                node.workspace_identity,
                node.selected_provider,
                node.final_provider,
                json_opt(&node.output_state)?,
                json_opt(&node.routing_state)?,
                node.error
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                node.instruction_manifest_hash,
                node.instruction_adapter_mode.map(|m| m.as_str()),
                node.resolved_agent_id,
                node.resolved_role_id,
                node.created_at.to_rfc3339(),
                node.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    /// Load one node record.
    pub fn get_run_node(&self, run_node_id: &str) -> Result<FlowchartRunNode, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM flowchart_run_nodes WHERE run_node_id = ?1"
        ))?;
        let node = stmt
            .query_row(params![run_node_id], map_node_row)
            .optional()?
            .ok_or_else(|| StoreError::not_found("flowchart_run_node", run_node_id))?;
        node_from_raw(node)
    }

    /// All node records of a run, in creation order.
    pub fn list_run_nodes(&self, run_id: &str) -> Result<Vec<FlowchartRunNode>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM flowchart_run_nodes WHERE run_id = ?1 ORDER BY created_at, run_node_id"
        ))?;
        let rows = stmt.query_map(params![run_id], map_node_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(node_from_raw(row?)?);
        }
        Ok(nodes)
    }

    /// Record a successful Job submission: `dispatch_pending ->
    /// dispatch_submitted` with the dispatch id.
    ///
    /// Idempotent on the node attempt: when the node already carries a
    /// dispatch id (a concurrent or repeated submission), the existing id
    /// is returned and nothing is written - the conflicting caller reuses
    /// the first dispatch record.
    pub fn record_dispatch_submitted(
        &self,
        run_node_id: &str,
        provider_dispatch_id: &str,
        job_name: &str,
        events: &[StagedEvent],
    ) -> Result<String, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT dispatch_status, provider_dispatch_id
                 FROM flowchart_run_nodes WHERE run_node_id = ?1",
                params![run_node_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (status, existing) =
            current.ok_or_else(|| StoreError::not_found("flowchart_run_node", run_node_id))?;
        let status: DispatchStatus = enum_from_str(&status)?;

        if let Some(existing) = existing {
            return Ok(existing);
        }
        if !status.can_transition(DispatchStatus::DispatchSubmitted) {
            return Err(StoreError::Constraint(format!(
                "illegal dispatch transition {status} -> dispatch_submitted for {run_node_id}"
            )));
        }
        tx.execute(
            "UPDATE flowchart_run_nodes
             SET dispatch_status = 'dispatch_submitted',
                 provider_dispatch_id = ?2,
                 k8s_job_name = ?3
             WHERE run_node_id = ?1",
            params![run_node_id, provider_dispatch_id, job_name],
        )?;
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(provider_dispatch_id.to_string())
    }

    /// Record marker receipt: `dispatch_submitted -> dispatch_confirmed`,
    /// node goes `running`.
    pub fn record_dispatch_confirmed(
        &self,
        run_node_id: &str,
        pod_name: Option<&str>,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        self.transition_dispatch(
            run_node_id,
            DispatchStatus::DispatchConfirmed,
            |tx| {
                tx.execute(
                    "UPDATE flowchart_run_nodes
                     SET dispatch_status = 'dispatch_confirmed',
                         status = 'running',
                         k8s_pod_name = COALESCE(?2, k8s_pod_name)
                     WHERE run_node_id = ?1",
                    params![run_node_id, pod_name],
                )?;
                Ok(())
            },
            events,
        )
    }

    /// Record a dispatch failure, optionally ambiguous.
    ///
    /// The node is terminal `failed`; an uncertain dispatch is fail-closed
    /// and is never retried automatically.
    pub fn record_dispatch_failed(
        &self,
        run_node_id: &str,
        uncertain: bool,
        error: &ErrorEnvelope,
        terminal_reason: Option<&str>,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let error_json = serde_json::to_string(error)?;
        self.transition_dispatch(
            run_node_id,
            DispatchStatus::DispatchFailed,
            |tx| {
                tx.execute(
                    "UPDATE flowchart_run_nodes
                     SET dispatch_status = 'dispatch_failed',
                         dispatch_uncertain = ?2,
                         status = 'failed',
                         error = ?3,
                         k8s_terminal_reason = COALESCE(?4, k8s_terminal_reason),
                         finished_at = ?5
                     WHERE run_node_id = ?1",
                    params![
                        run_node_id,
                        uncertain as i64,
                        error_json,
                        terminal_reason,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            },
            events,
        )
    }

    fn transition_dispatch(
        &self,
        run_node_id: &str,
        next: DispatchStatus,
        apply: impl FnOnce(&Transaction<'_>) -> Result<(), StoreError>,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT dispatch_status FROM flowchart_run_nodes WHERE run_node_id = ?1",
                params![run_node_id],
                |row| row.get(0),
            )
            .optional()?;
        let current =
            current.ok_or_else(|| StoreError::not_found("flowchart_run_node", run_node_id))?;
        let current: DispatchStatus = enum_from_str(&current)?;
        if !current.can_transition(next) {
            return Err(StoreError::Constraint(format!(
                "illegal dispatch transition {current} -> {next} for {run_node_id}"
            )));
        }
        apply(&tx)?;
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a node's terminal result from the executor.
    #[allow(clippy::too_many_arguments)]
    pub fn record_node_result(
        &self,
        run_node_id: &str,
        status: NodeStatus,
        output_state: Option<&Value>,
        routing_state: Option<&Value>,
        error: Option<&ErrorEnvelope>,
        pod_name: Option<&str>,
        terminal_reason: Option<&str>,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE flowchart_run_nodes
             SET status = ?2,
                 output_state = ?3,
                 routing_state = ?4,
                 error = ?5,
                 final_provider = 'kubernetes',
                 k8s_pod_name = COALESCE(?6, k8s_pod_name),
                 k8s_terminal_reason = COALESCE(?7, k8s_terminal_reason),
                 finished_at = ?8
             WHERE run_node_id = ?1",
            params![
                run_node_id,
                status.as_str(),
                output_state
                    .map(serde_json::to_string)
                    .transpose()?,
                routing_state
                    .map(serde_json::to_string)
                    .transpose()?,
                error.map(serde_json::to_string).transpose()?,
                pod_name,
                terminal_reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("flowchart_run_node", run_node_id));
        }
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    /// Attach instruction package metadata to a node (no observable event).
    pub fn set_node_instruction_meta(
        &self,
        run_node_id: &str,
        manifest_hash: &str,
        adapter_mode: AdapterMode,
        resolved_agent_id: Option<&str>,
        resolved_role_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE flowchart_run_nodes
             SET instruction_manifest_hash = ?2,
                 instruction_adapter_mode = ?3,
                 resolved_agent_id = ?4,
                 resolved_role_id = ?5
             WHERE run_node_id = ?1",
            params![
                run_node_id,
                manifest_hash,
                adapter_mode.as_str(),
                resolved_agent_id,
                resolved_role_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("flowchart_run_node", run_node_id));
        }
        Ok(())
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Persist one artifact.
    pub fn insert_artifact(
        &self,
        artifact: &Artifact,
        events: &[StagedEvent],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO flowchart_run_node_artifacts (
                artifact_id, run_node_id, kind, payload, content_hash, created_at,
                retention_mode, retention_ttl_seconds, retention_max_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                artifact.artifact_id,
                artifact.run_node_id,
                artifact.kind.as_str(),
                serde_json::to_string(&artifact.payload)?,
                artifact.content_hash,
                artifact.created_at.to_rfc3339(),
                retention_mode_str(artifact.retention_mode),
                artifact.retention_ttl_seconds,
                artifact.retention_max_count,
            ],
        )?;
        Self::stage_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    /// Artifacts of one node, newest first.
    pub fn list_artifacts(&self, run_node_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, run_node_id, kind, payload, content_hash, created_at,
                    retention_mode, retention_ttl_seconds, retention_max_count
             FROM flowchart_run_node_artifacts
             WHERE run_node_id = ?1
             ORDER BY created_at DESC, artifact_id",
        )?;
        let rows = stmt.query_map(params![run_node_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<u64>>(7)?,
                row.get::<_, Option<u32>>(8)?,
            ))
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            let row = row?;
            artifacts.push(Artifact {
                artifact_id: row.0,
                run_node_id: row.1,
                kind: enum_from_str::<ArtifactKind>(&row.2)?,
                payload: serde_json::from_str(&row.3)?,
                content_hash: row.4,
                created_at: parse_ts(&row.5)?,
                retention_mode: enum_from_str::<RetentionMode>(&row.6)?,
                retention_ttl_seconds: row.7,
                retention_max_count: row.8,
            });
        }
        Ok(artifacts)
    }

    /// Apply retention controls: drop ttl-expired artifacts and trim
    /// max-count overflow per node, newest kept. Maintenance path only;
    /// never called during a live run.
    pub fn prune_artifacts(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ttl_pruned = tx.execute(
            "DELETE FROM flowchart_run_node_artifacts
             WHERE retention_mode = 'ttl'
               AND retention_ttl_seconds IS NOT NULL
               AND datetime(created_at, '+' || retention_ttl_seconds || ' seconds')
                   <= datetime(?1)",
            params![now.to_rfc3339()],
        )?;
        let count_pruned = tx.execute(
            "DELETE FROM flowchart_run_node_artifacts
             WHERE artifact_id IN (
                 SELECT artifact_id FROM (
                     SELECT artifact_id, retention_mode, retention_max_count,
                            ROW_NUMBER() OVER (
                                PARTITION BY run_node_id
                                ORDER BY created_at DESC, artifact_id
                            ) AS newest_rank
                     FROM flowchart_run_node_artifacts
                 )
                 WHERE retention_mode = 'max_count'
                   AND retention_max_count IS NOT NULL
                   AND newest_rank > retention_max_count
             )",
            params![],
        )?;
        tx.commit()?;
        Ok(ttl_pruned + count_pruned)
    }

    // ── Outbox ────────────────────────────────────────────────────────

    /// Unpublished envelopes in per-stream sequence order.
    pub fn fetch_unpublished_events(&self) -> Result<Vec<EventEnvelope>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, idempotency_key, sequence_stream, sequence, emitted_at,
                    event_type, entity_kind, entity_id, room_keys, payload, contract_version
             FROM event_outbox
             WHERE published = 0
             ORDER BY sequence_stream, sequence",
        )?;
        let rows = stmt.query_map(params![], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let row = row?;
            events.push(EventEnvelope {
                event_id: row.0,
                idempotency_key: row.1,
                sequence_stream: row.2,
                sequence: row.3,
                emitted_at: parse_ts(&row.4)?,
                event_type: row.5,
                entity_kind: row.6,
                entity_id: row.7,
                room_keys: serde_json::from_str(&row.8)?,
                payload: serde_json::from_str(&row.9)?,
                contract_version: row.10,
            });
        }
        Ok(events)
    }

    /// Mark one envelope published.
    pub fn mark_event_published(&self, event_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE event_outbox SET published = 1 WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    /// All outbox envelopes for a stream, for inspection/testing.
    pub fn events_for_stream(&self, stream: &str) -> Result<Vec<EventEnvelope>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, idempotency_key, sequence_stream, sequence, emitted_at,
                    event_type, entity_kind, entity_id, room_keys, payload, contract_version
             FROM event_outbox WHERE sequence_stream = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![stream], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let row = row?;
            events.push(EventEnvelope {
                event_id: row.0,
                idempotency_key: row.1,
                sequence_stream: row.2,
                sequence: row.3,
                emitted_at: parse_ts(&row.4)?,
                event_type: row.5,
                entity_kind: row.6,
                entity_id: row.7,
                room_keys: serde_json::from_str(&row.8)?,
                payload: serde_json::from_str(&row.9)?,
                contract_version: row.10,
            });
        }
        Ok(events)
    }

    // ── Integration settings ──────────────────────────────────────────

    /// Opaque ciphertext for one integration key.
    pub fn get_integration(
        &self,
        provider: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT ciphertext FROM integration_settings WHERE provider = ?1 AND key = ?2",
                params![provider, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Upsert an integration blob (admin path).
    pub fn put_integration(
        &self,
        provider: &str,
        key: &str,
        ciphertext: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO integration_settings (provider, key, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider, key) DO UPDATE SET ciphertext = ?3, updated_at = ?4",
            params![provider, key, ciphertext, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Executor settings ─────────────────────────────────────────────

    /// Load the settings row, if present.
    pub fn load_executor_settings(&self) -> Result<Option<NodeExecutorSettings>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM node_executor_settings WHERE id = 1",
                params![],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(StoreError::from))
            .transpose()
    }

    /// Upsert the settings row (admin path).
    pub fn save_executor_settings(
        &self,
        settings: &NodeExecutorSettings,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_executor_settings (id, payload, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload = ?1, updated_at = ?2",
            params![
                serde_json::to_string(settings)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn retention_mode_str(mode: RetentionMode) -> &'static str {
    match mode {
        RetentionMode::Keep => "keep",
        RetentionMode::Ttl => "ttl",
        RetentionMode::MaxCount => "max_count",
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Constraint(format!("bad timestamp '{s}': {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Column list shared by node row readers.
const NODE_COLUMNS: &str = "run_node_id, run_id, node_id, node_type, attempt_index, status, \
     dispatch_status, dispatch_uncertain, provider_dispatch_id, k8s_job_name, k8s_pod_name, \
     k8s_terminal_reason, workspace_identity, selected_provider, final_provider, output_state, \
     routing_state, error, instruction_manifest_hash, instruction_adapter_mode, \
     resolved_agent_id, resolved_role_id, created_at, finished_at";

type RawNodeRow = (
    String,
    String,
    String,
    String,
    u32,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn map_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNodeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
        row.get(20)?,
        row.get(21)?,
        row.get(22)?,
        row.get(23)?,
    ))
}

fn node_from_raw(row: RawNodeRow) -> Result<FlowchartRunNode, StoreError> {
    Ok(FlowchartRunNode {
        run_node_id: row.0,
        run_id: row.1,
        node_id: row.2,
        node_type: enum_from_str::<NodeType>(&row.3)?,
        attempt_index: row.4,
        status: enum_from_str::<NodeStatus>(&row.5)?,
        dispatch_status: enum_from_str::<DispatchStatus>(&row.6)?,
        dispatch_uncertain: row.7 != 0,
        provider_dispatch_id: row.8,
        k8s_job_name: row.9,
        k8s_pod_name: row.10,
        k8s_terminal_reason: row.11,
        workspace_identity: row.12,
        selected_provider: row.13,
        final_provider: row.14,
        output_state: row.15.map(|s| serde_json::from_str(&s)).transpose()?,
        routing_state: row.16.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.17.map(|s| serde_json::from_str(&s)).transpose()?,
        instruction_manifest_hash: row.18,
        instruction_adapter_mode: row
            .19
            .map(|s| enum_from_str::<AdapterMode>(&s))
            .transpose()?,
        resolved_agent_id: row.20,
        resolved_role_id: row.21,
        created_at: parse_ts(&row.22)?,
        finished_at: parse_ts_opt(row.23)?,
    })
}
