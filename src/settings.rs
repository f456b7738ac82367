//! Runtime configuration for the node executor subsystem.
//!
//! Settings are persisted in the store as a single row and served through a
//! process-wide [`SettingsProvider`]: initialized once at startup,
//! refreshable when the admin path mutates them, and snapshot-captured per
//! run so a run never observes a mid-flight change.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::store::Store;

/// Executor runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeExecutorSettings {
    /// Budget for Job submission plus startup marker, in seconds.
    pub dispatch_timeout_seconds: u64,
    /// Hard wall-clock budget for one node execution.
    pub execution_timeout_seconds: u64,
    /// Budget for draining pod logs after the Job goes terminal.
    pub log_collection_timeout_seconds: u64,
    /// Grace window before a cancel escalates.
    pub cancel_grace_timeout_seconds: u64,
    /// Whether force cancel may hard-kill Jobs.
    pub cancel_force_kill_enabled: bool,
    /// Label key carrying the stable workspace identity.
    pub workspace_identity_key: String,
    /// Namespace Jobs are created in.
    pub k8s_namespace: String,
    /// Frontier executor image repository.
    pub k8s_frontier_image: String,
    /// Frontier executor image tag or digest reference.
    pub k8s_frontier_image_tag: String,
    /// vLLM executor image repository.
    pub k8s_vllm_image: String,
    /// vLLM executor image tag or digest reference.
    pub k8s_vllm_image_tag: String,
    /// Use in-cluster Kubernetes config.
    pub k8s_in_cluster: bool,
    /// Service account for executor pods.
    pub k8s_service_account: Option<String>,
    /// Image pull secrets attached to executor pods.
    pub k8s_image_pull_secrets: Vec<String>,
    /// Opaque encrypted kubeconfig; decrypted only by the credential path.
    pub k8s_kubeconfig: Option<String>,
    /// GPU limit applied to vLLM-class pods.
    pub k8s_gpu_limit: Option<u32>,
    /// `ttlSecondsAfterFinished` for terminal Jobs.
    pub k8s_job_ttl_seconds: u64,
    /// Strict agent-runtime contract (decision conditions mandatory).
    pub agent_runtime_cutover_enabled: bool,
}

impl Default for NodeExecutorSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_seconds: 120,
            execution_timeout_seconds: 3600,
            log_collection_timeout_seconds: 30,
            cancel_grace_timeout_seconds: 30,
            cancel_force_kill_enabled: true,
            workspace_identity_key: "llmctl.dev/workspace".to_string(),
            k8s_namespace: "llmctl".to_string(),
            k8s_frontier_image: "ghcr.io/llmctl/executor-frontier".to_string(),
            k8s_frontier_image_tag: "latest".to_string(),
            k8s_vllm_image: "ghcr.io/llmctl/executor-vllm".to_string(),
            k8s_vllm_image_tag: "latest".to_string(),
            k8s_in_cluster: true,
            k8s_service_account: None,
            k8s_image_pull_secrets: Vec::new(),
            k8s_kubeconfig: None,
            k8s_gpu_limit: None,
            k8s_job_ttl_seconds: 600,
            agent_runtime_cutover_enabled: true,
        }
    }
}

impl NodeExecutorSettings {
    /// Full image reference string for the given runtime class.
    pub fn image_reference(&self, class: crate::flowchart::RuntimeClass) -> String {
        let (repo, tag) = match class {
            crate::flowchart::RuntimeClass::Frontier => {
                (&self.k8s_frontier_image, &self.k8s_frontier_image_tag)
            }
            crate::flowchart::RuntimeClass::Vllm => {
                (&self.k8s_vllm_image, &self.k8s_vllm_image_tag)
            }
        };
        if tag.starts_with("sha256:") {
            format!("{repo}@{tag}")
        } else if tag.is_empty() {
            repo.clone()
        } else {
            format!("{repo}:{tag}")
        }
    }
}

/// Process-wide settings holder.
///
/// Reads are cheap `Arc` clones; `refresh` swaps the whole snapshot so
/// in-flight runs keep the settings they started with.
pub struct SettingsProvider {
    current: RwLock<Arc<NodeExecutorSettings>>,
}

impl SettingsProvider {
    /// Provider seeded with explicit settings.
    pub fn new(settings: NodeExecutorSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Load the persisted row, falling back to defaults when absent.
    pub fn load(store: &Store) -> Result<Self, StoreError> {
        let settings = store.load_executor_settings()?.unwrap_or_default();
        Ok(Self::new(settings))
    }

    /// Current snapshot; runs capture this once at start.
    pub fn snapshot(&self) -> Arc<NodeExecutorSettings> {
        self.current
            .read()
            .map(|g| Arc::clone(&g))
            .unwrap_or_default()
    }

    /// Re-read the persisted row and swap the snapshot.
    pub fn refresh(&self, store: &Store) -> Result<(), StoreError> {
        let settings = store.load_executor_settings()?.unwrap_or_default();
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(settings);
        }
        Ok(())
    }
}
