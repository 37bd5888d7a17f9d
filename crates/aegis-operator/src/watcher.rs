//! Cluster fault watcher
//!
//! Polls pods and deployments in the watched namespaces and turns failure
//! states into incidents on the queue.

use aegis_cluster::{ops, ClusterOps};
use aegis_common::{
    metrics, Config, Error, Incident, Priority, ResourceKind, ResourceRef, Severity, TriggerSignal,
};
use aegis_queue::IncidentQueue;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A classified fault, before it becomes an incident
#[derive(Debug, Clone)]
pub struct Detection {
    pub resource: ResourceRef,
    pub priority: Priority,
    pub severity: Severity,
    pub trigger: TriggerSignal,
}

pub struct EventWatcher {
    cluster: Arc<dyn ClusterOps>,
    queue: Arc<IncidentQueue>,
    namespaces: Vec<String>,
    interval: Duration,
}

impl EventWatcher {
    pub fn new(cluster: Arc<dyn ClusterOps>, queue: Arc<IncidentQueue>, config: &Config) -> Self {
        let mut namespaces: BTreeSet<String> = config
            .queue
            .production_namespaces
            .iter()
            .cloned()
            .collect();
        namespaces.insert(config.cluster.namespace.clone());
        Self {
            cluster,
            queue,
            namespaces: namespaces.into_iter().collect(),
            interval: Duration::from_secs(config.operator.watch_interval_seconds),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(namespaces = ?self.namespaces, "fault watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let enqueued = self.scan_once().await;
            if enqueued > 0 {
                debug!(enqueued, "watcher pass enqueued incidents");
            }
        }
        info!("fault watcher stopped");
    }

    /// One scan over all watched namespaces; returns how many incidents
    /// were enqueued (merges count).
    pub async fn scan_once(&self) -> usize {
        let mut detections = Vec::new();
        for namespace in &self.namespaces {
            match self.cluster.list_pods(namespace, None).await {
                Ok(pods) => {
                    for pod in &pods {
                        if let Some(detection) = classify_pod(namespace, pod) {
                            detections.push(detection);
                        }
                    }
                }
                Err(e) => warn!(namespace = %namespace, error = %e, "pod scan failed"),
            }
            match self.cluster.list_deployments(namespace).await {
                Ok(deployments) => {
                    for deployment in &deployments {
                        if let Some(detection) = classify_deployment(namespace, deployment) {
                            detections.push(detection);
                        }
                    }
                }
                Err(e) => warn!(namespace = %namespace, error = %e, "deployment scan failed"),
            }
        }

        let mut enqueued = 0;
        for detection in detections {
            let incident = Incident::new(
                detection.resource.clone(),
                detection.priority,
                detection.severity,
                detection.trigger.clone(),
            );
            metrics::incident_detected(
                detection.severity,
                &detection.resource.kind,
                &detection.resource.namespace,
            );
            match self.queue.enqueue(incident).await {
                Ok(id) => {
                    enqueued += 1;
                    info!(
                        incident_id = %id,
                        resource = %detection.resource,
                        priority = %detection.priority,
                        trigger = %detection.trigger,
                        "incident enqueued"
                    );
                }
                Err(Error::QueueFull(capacity)) => {
                    warn!(capacity, resource = %detection.resource, "queue full, dropping detection");
                }
                Err(e) => warn!(error = %e, "enqueue failed"),
            }
        }
        enqueued
    }
}

/// Classify a pod's failure state, if any.
pub fn classify_pod(namespace: &str, pod: &Pod) -> Option<Detection> {
    let name = pod.metadata.name.clone()?;
    let resource = ResourceRef::new(namespace, ResourceKind::Pod, name);
    let phase = ops::pod_phase(pod);

    if phase == "Failed" || phase == "Unknown" {
        return Some(Detection {
            resource,
            priority: Priority::P0,
            severity: Severity::Critical,
            trigger: TriggerSignal::PhaseTransition { phase },
        });
    }

    if ops::pod_oom_killed(pod) {
        return Some(Detection {
            resource,
            priority: Priority::P1,
            severity: Severity::High,
            trigger: TriggerSignal::OomKill,
        });
    }

    if let Some(reason) = ops::pod_waiting_reason(pod) {
        let (priority, severity) = match reason.as_str() {
            "CrashLoopBackOff" => (Priority::P1, Severity::High),
            "ImagePullBackOff" | "ErrImagePull" => (Priority::P2, Severity::Medium),
            "CreateContainerConfigError" => (Priority::P2, Severity::Medium),
            _ => return None,
        };
        return Some(Detection {
            resource,
            priority,
            severity,
            trigger: TriggerSignal::PhaseTransition { phase: reason },
        });
    }

    if phase == "Running" && !ops::pod_is_ready(pod) && ops::pod_restart_count(pod) > 0 {
        return Some(Detection {
            resource,
            priority: Priority::P2,
            severity: Severity::Medium,
            trigger: TriggerSignal::ProbeFailure {
                probe: "readiness".to_string(),
            },
        });
    }

    None
}

/// Classify a deployment's replica shortfall, if any.
pub fn classify_deployment(namespace: &str, deployment: &Deployment) -> Option<Detection> {
    let name = deployment.metadata.name.clone()?;
    let (ready, desired) = ops::deployment_replicas(deployment);
    let ratio = ops::deployment_unavailable_ratio(deployment);
    if desired <= 0 || ratio <= 0.0 {
        return None;
    }

    let (priority, severity) = if ratio > 0.75 {
        (Priority::P0, Severity::Critical)
    } else if ratio >= 0.5 {
        (Priority::P1, Severity::High)
    } else {
        return None;
    };
    Some(Detection {
        resource: ResourceRef::new(namespace, ResourceKind::Deployment, name),
        priority,
        severity,
        trigger: TriggerSignal::ReplicaShortfall { ready, desired },
    })
}
