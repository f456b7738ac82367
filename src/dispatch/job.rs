//! Kubernetes Job construction.
//!
//! One Job per node attempt. The Job name is deterministic from
//! `(run_node_id, attempt_index)` so a duplicate submission collides on
//! the API server instead of creating a second execution; the provider
//! dispatch id is namespaced `kubernetes:<job_name>`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use llmctl_contract::PAYLOAD_ENV_VAR;

use super::image::ImageReference;
use super::DispatchTicket;
use crate::errors::DispatchError;
use crate::settings::NodeExecutorSettings;

/// Deterministic Job name for a node attempt.
///
/// Kubernetes object names must be lowercase RFC 1123 labels of at most 63
/// characters; run node ids are sanitized accordingly.
pub fn job_name(run_node_id: &str, attempt_index: u32) -> String {
    let sanitized: String = run_node_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let sanitized = sanitized.trim_matches('-');
    let suffix = format!("-a{attempt_index}");
    let budget = 63 - "llmctl-".len() - suffix.len();
    let head: String = sanitized.chars().take(budget).collect();
    format!("llmctl-{}{suffix}", head.trim_matches('-'))
}

/// Provider dispatch id for a Job.
pub fn provider_dispatch_id(job_name: &str) -> String {
    format!("kubernetes:{job_name}")
}

/// Build the Job object for a ticket.
///
/// The image reference is validated here; a malformed reference is a
/// `validation_error` that must surface before any API call.
pub fn build_job(
    ticket: &DispatchTicket,
    settings: &NodeExecutorSettings,
) -> Result<Job, DispatchError> {
    let image = ImageReference::parse(&settings.image_reference(ticket.runtime_class))?;
    let name = job_name(&ticket.run_node_id, ticket.attempt_index);

    let payload = serde_json::to_string(&ticket.request)
        .map_err(|e| DispatchError::JobApi(format!("cannot serialize execution request: {e}")))?;

    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/managed-by".to_string(), "llmctl".to_string());
    labels.insert("llmctl.dev/run-id".to_string(), ticket.run_id.clone());
    labels.insert(
        "llmctl.dev/run-node-id".to_string(),
        ticket.run_node_id.clone(),
    );
    labels.insert(
        "llmctl.dev/attempt-index".to_string(),
        ticket.attempt_index.to_string(),
    );
    labels.insert(
        settings.workspace_identity_key.clone(),
        ticket.workspace_identity.clone(),
    );
    labels.insert(
        "llmctl.dev/provider-dispatch-id".to_string(),
        provider_dispatch_id(&name),
    );

    let mut env = vec![EnvVar {
        name: PAYLOAD_ENV_VAR.to_string(),
        value: Some(payload),
        ..Default::default()
    }];
    for (key, value) in &ticket.env {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        });
    }

    let resources = settings.k8s_gpu_limit.map(|gpus| ResourceRequirements {
        limits: Some(BTreeMap::from([(
            "nvidia.com/gpu".to_string(),
            Quantity(gpus.to_string()),
        )])),
        ..Default::default()
    });

    let container = Container {
        name: "executor".to_string(),
        image: Some(image.to_string()),
        env: Some(env),
        resources,
        ..Default::default()
    };

    let image_pull_secrets = if settings.k8s_image_pull_secrets.is_empty() {
        None
    } else {
        Some(
            settings
                .k8s_image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference {
                    name: name.clone(),
                })
                .collect(),
        )
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        service_account_name: settings.k8s_service_account.clone(),
        image_pull_secrets,
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(settings.k8s_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(settings.execution_timeout_seconds as i64),
            ttl_seconds_after_finished: Some(settings.k8s_job_ttl_seconds as i32),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::RuntimeClass;
    use llmctl_contract::{ExecutionRequest, NodeExecution, SandboxPaths};

    fn ticket() -> DispatchTicket {
        let execution = NodeExecution {
            configuration: serde_json::json!({}),
            input_context: String::new(),
            attachments: vec![],
            enabled_providers: vec![],
            default_model_id: None,
            mcp_server_keys: vec![],
            sandbox: SandboxPaths::for_workspace("/workspace/run-1"),
        };
        DispatchTicket {
            run_id: "run-1".to_string(),
            run_node_id: "rn-Alpha_1".to_string(),
            attempt_index: 0,
            workspace_identity: "ws-1".to_string(),
            runtime_class: RuntimeClass::Frontier,
            request: ExecutionRequest::v1("req-1", "exec-1", "node-a", "task", 900, execution),
            env: vec![("LLMCTL_INTEGRATION_GITHUB_TOKEN".to_string(), "tok".to_string())],
        }
    }

    #[test]
    fn job_name_is_deterministic_and_sanitized() {
        assert_eq!(job_name("rn-Alpha_1", 0), "llmctl-rn-alpha-1-a0");
        assert_eq!(job_name("rn-Alpha_1", 0), job_name("rn-Alpha_1", 0));
        assert_ne!(job_name("rn-Alpha_1", 0), job_name("rn-Alpha_1", 1));

        let long = "n".repeat(100);
        assert!(job_name(&long, 12).len() <= 63);
    }

    #[test]
    fn provider_dispatch_id_is_namespaced() {
        assert_eq!(
            provider_dispatch_id("llmctl-rn-1-a0"),
            "kubernetes:llmctl-rn-1-a0"
        );
    }

    #[test]
    fn job_shape_matches_settings() {
        let settings = NodeExecutorSettings::default();
        let job = build_job(&ticket(), &settings).unwrap();

        assert_eq!(job.metadata.namespace.as_deref(), Some("llmctl"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(3600));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/llmctl/executor-frontier:latest")
        );

        // Payload env var carries the serialized request.
        let env = container.env.as_ref().unwrap();
        let payload = env
            .iter()
            .find(|e| e.name == PAYLOAD_ENV_VAR)
            .and_then(|e| e.value.clone())
            .unwrap();
        let request: ExecutionRequest = serde_json::from_str(&payload).unwrap();
        assert_eq!(request.node_id, "node-a");

        // Integration bundle flows into the environment.
        assert!(env.iter().any(|e| e.name == "LLMCTL_INTEGRATION_GITHUB_TOKEN"));
    }

    #[test]
    fn labels_carry_dispatch_identity() {
        let settings = NodeExecutorSettings::default();
        let job = build_job(&ticket(), &settings).unwrap();
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels.get("llmctl.dev/run-id").unwrap(), "run-1");
        assert_eq!(labels.get("llmctl.dev/run-node-id").unwrap(), "rn-Alpha_1");
        assert_eq!(labels.get("llmctl.dev/attempt-index").unwrap(), "0");
        assert_eq!(labels.get("llmctl.dev/workspace").unwrap(), "ws-1");
        assert!(
            labels
                .get("llmctl.dev/provider-dispatch-id")
                .unwrap()
                .starts_with("kubernetes:")
        );
    }

    #[test]
    fn vllm_class_uses_vllm_image_and_gpu_limit() {
        let mut settings = NodeExecutorSettings::default();
        settings.k8s_gpu_limit = Some(1);
        let mut ticket = ticket();
        ticket.runtime_class = RuntimeClass::Vllm;

        let job = build_job(&ticket, &settings).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/llmctl/executor-vllm:latest")
        );
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("nvidia.com/gpu").unwrap().0, "1");
    }

    #[test]
    fn pull_secrets_attach_to_pod_spec() {
        let mut settings = NodeExecutorSettings::default();
        settings.k8s_image_pull_secrets = vec!["regcred".to_string()];
        let job = build_job(&ticket(), &settings).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let secrets = pod.image_pull_secrets.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, "regcred");
    }

    #[test]
    fn malformed_image_fails_before_submission() {
        let mut settings = NodeExecutorSettings::default();
        settings.k8s_frontier_image_tag = "sha256:notahash".to_string();
        let err = build_job(&ticket(), &settings).unwrap_err();
        assert!(matches!(
            err,
            crate::errors::DispatchError::MalformedImageReference { .. }
        ));
    }
}
