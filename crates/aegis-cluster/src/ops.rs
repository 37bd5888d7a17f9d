//! Abstract cluster operations consumed by the AEGIS core
//!
//! Everything the pipeline needs from the orchestrator goes through this
//! trait; the kube-backed implementation and the in-memory mock are
//! interchangeable behind it.

use aegis_common::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use serde_json::Value;
use std::collections::BTreeMap;

/// Narrow cluster API surface
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn create_pod(&self, namespace: &str, manifest: Value) -> Result<()>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, namespace: &str, manifest: Value) -> Result<()>;

    /// Strategic-merge patch against an existing deployment.
    async fn patch_deployment(&self, namespace: &str, name: &str, patch: Value) -> Result<()>;

    /// Replace a deployment with a full manifest (rollback path).
    async fn replace_deployment(&self, namespace: &str, name: &str, manifest: Value) -> Result<()>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Rollout-restart via a template annotation bump.
    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// Delete a namespace; absence is not an error.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Namespace names matching a label selector.
    async fn list_namespaces(&self, label_selector: Option<&str>) -> Result<Vec<String>>;

    async fn apply_resource_quota(&self, namespace: &str, cpu: &str, memory: &str) -> Result<()>;

    async fn apply_deny_all_policy(&self, namespace: &str) -> Result<()>;

    /// Tail of one pod's logs, newest last.
    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: i64,
        since_seconds: Option<i64>,
    ) -> Result<String>;

    /// Human-readable recent events for a namespace, optionally filtered to
    /// one object.
    async fn recent_events(&self, namespace: &str, name: Option<&str>) -> Result<Vec<String>>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;
}

/// Pod phase string, empty when status is missing.
pub fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default()
}

/// Whether every container in the pod reports ready.
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    match status.container_statuses.as_ref() {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|c| c.ready),
        _ => false,
    }
}

/// Sum of container restart counts.
pub fn pod_restart_count(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| cs.iter().map(|c| c.restart_count).sum())
        .unwrap_or(0)
}

/// Waiting reason of the first waiting container, e.g. `CrashLoopBackOff`.
pub fn pod_waiting_reason(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|c| {
            c.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone())
        })
}

/// Whether any container was last terminated by the OOM killer.
pub fn pod_oom_killed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| {
            cs.iter().any(|c| {
                c.last_state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.reason.as_deref())
                    == Some("OOMKilled")
            })
        })
        .unwrap_or(false)
}

/// `(ready, desired)` replica counts for a deployment.
pub fn deployment_replicas(deployment: &Deployment) -> (i32, i32) {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    (ready, desired)
}

/// Fraction of desired replicas currently unavailable, in `[0, 1]`.
pub fn deployment_unavailable_ratio(deployment: &Deployment) -> f64 {
    let (ready, desired) = deployment_replicas(deployment);
    if desired <= 0 {
        return 0.0;
    }
    ((desired - ready).max(0) as f64) / desired as f64
}

/// Fraction of log lines that look like errors, the error-rate signal used
/// by shadow health scoring and the rollback watcher.
pub fn log_error_rate(log_text: &str) -> f64 {
    let mut total = 0usize;
    let mut errors = 0usize;
    for line in log_text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        total += 1;
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("panic") || lower.contains("fatal") {
            errors += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        errors as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};

    fn container_status(ready: bool, restarts: i32) -> ContainerStatus {
        ContainerStatus {
            name: "main".to_string(),
            ready,
            restart_count: restarts,
            image: "demo:1".to_string(),
            image_id: String::new(),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_requires_all_containers() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![container_status(true, 0), container_status(false, 2)]),
            ..Default::default()
        });
        assert!(!pod_is_ready(&pod));
        assert_eq!(pod_restart_count(&pod), 2);
    }

    #[test]
    fn pod_without_status_is_not_ready() {
        let pod = Pod::default();
        assert!(!pod_is_ready(&pod));
        assert_eq!(pod_phase(&pod), "");
    }

    #[test]
    fn detects_oom_kill_in_last_state() {
        let mut status = container_status(false, 4);
        status.last_state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("OOMKilled".to_string()),
                exit_code: 137,
                ..Default::default()
            }),
            ..Default::default()
        });
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![status]),
            ..Default::default()
        });
        assert!(pod_oom_killed(&pod));
    }

    #[test]
    fn error_rate_counts_marked_lines() {
        let logs = "ok\nERROR: boom\nok\nok\n";
        assert!((log_error_rate(logs) - 0.25).abs() < f64::EPSILON);
        assert_eq!(log_error_rate(""), 0.0);
    }
}
