//! Post-apply rollback watcher
//!
//! Monitors an applied fix for a bounded window and reverts to the pre-apply
//! snapshot when the error rate spikes past the baseline or restarts climb.

use crate::executor::FixExecutor;
use aegis_cluster::{ops, ClusterOps};
use aegis_common::config::RollbackConfig;
use aegis_common::{metrics, ResourceRef};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const REASON_ERROR_RATE: &str = "error_rate_spike";
pub const REASON_RESTARTS: &str = "restart_spike";

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    /// The window elapsed without a trigger.
    Healthy,
    RolledBack { reason: String },
    Cancelled,
    /// A trigger fired but the rollback itself failed.
    RollbackFailed { reason: String, error: String },
}

pub struct RollbackWatcher {
    cluster: Arc<dyn ClusterOps>,
    executor: Arc<FixExecutor>,
    config: RollbackConfig,
}

impl RollbackWatcher {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        executor: Arc<FixExecutor>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            cluster,
            executor,
            config,
        }
    }

    /// Measure the current error rate, used to capture the pre-apply
    /// baseline.
    pub async fn measure_error_rate(&self, resource: &ResourceRef) -> f64 {
        let pods = self
            .cluster
            .list_pods(&resource.namespace, None)
            .await
            .unwrap_or_default();
        let Some(pod_name) = pods.first().and_then(|p| p.metadata.name.clone()) else {
            return 0.0;
        };
        self.cluster
            .pod_logs(&resource.namespace, &pod_name, 200, None)
            .await
            .map(|text| ops::log_error_rate(&text))
            .unwrap_or(0.0)
    }

    async fn restart_count(&self, resource: &ResourceRef) -> i32 {
        self.cluster
            .list_pods(&resource.namespace, None)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|p| {
                p.metadata
                    .name
                    .as_deref()
                    .map(|n| n.starts_with(resource.name.as_str()) || resource.name.starts_with(n))
                    .unwrap_or(false)
            })
            .map(ops::pod_restart_count)
            .sum()
    }

    /// Watch the resource for the configured window and roll back on a
    /// trigger. Cancellable.
    pub async fn watch(
        &self,
        resource: &ResourceRef,
        snapshot: &Value,
        baseline_error_rate: f64,
        cancel: &CancellationToken,
    ) -> RollbackOutcome {
        if !self.config.rollback_enabled {
            return RollbackOutcome::Healthy;
        }
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.rollback_window_seconds);
        let poll = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        info!(
            resource = %resource,
            baseline_error_rate,
            window_seconds = self.config.rollback_window_seconds,
            "rollback watch started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RollbackOutcome::Cancelled,
                _ = tokio::time::sleep(poll) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                info!(resource = %resource, "rollback window elapsed, fix holds");
                return RollbackOutcome::Healthy;
            }

            let error_rate = self.measure_error_rate(resource).await;
            let restarts = self.restart_count(resource).await;
            debug!(resource = %resource, error_rate, restarts, "rollback watch sample");

            let reason = if error_rate_spiked(
                error_rate,
                baseline_error_rate,
                self.config.rollback_error_rate_threshold,
            ) {
                Some(REASON_ERROR_RATE)
            } else if restarts > self.config.restart_count_threshold {
                Some(REASON_RESTARTS)
            } else {
                None
            };

            if let Some(reason) = reason {
                warn!(
                    resource = %resource,
                    reason,
                    error_rate,
                    restarts,
                    "regression detected, rolling back"
                );
                metrics::rollback(&resource.kind, &resource.namespace, reason);
                match self.executor.rollback(resource, snapshot).await {
                    Ok(()) => {
                        return RollbackOutcome::RolledBack {
                            reason: reason.to_string(),
                        }
                    }
                    Err(e) => {
                        warn!(resource = %resource, error = %e, "rollback application failed");
                        return RollbackOutcome::RollbackFailed {
                            reason: reason.to_string(),
                            error: e.to_string(),
                        };
                    }
                }
            }
        }
    }
}

/// True when the observed rate exceeds the baseline by the configured
/// multiplier. A zero baseline falls back to an absolute floor so a quiet
/// service still trips on real errors.
fn error_rate_spiked(observed: f64, baseline: f64, threshold: f64) -> bool {
    if baseline > 0.0 {
        observed > baseline * threshold
    } else {
        observed > 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cluster::MockCluster;
    use aegis_common::ResourceKind;

    fn fast_config() -> RollbackConfig {
        RollbackConfig {
            rollback_window_seconds: 2,
            poll_interval_seconds: 1,
            ..Default::default()
        }
    }

    #[test]
    fn spike_detection_relative_and_absolute() {
        assert!(error_rate_spiked(0.3, 0.2, 1.2));
        assert!(!error_rate_spiked(0.2, 0.2, 1.2));
        assert!(error_rate_spiked(0.15, 0.0, 1.2));
        assert!(!error_rate_spiked(0.05, 0.0, 1.2));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_window_leaves_fix_in_place() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_deployment("production", "demo-api", "demo-api:1.2.3", 1);
        cluster.push_logs("production", &["ok", "ok", "ok"]);

        let executor = Arc::new(FixExecutor::new(cluster.clone()));
        let watcher = RollbackWatcher::new(cluster, executor, fast_config());
        let resource = ResourceRef::new("production", ResourceKind::Deployment, "demo-api");

        let outcome = watcher
            .watch(
                &resource,
                &serde_json::json!({}),
                0.2,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RollbackOutcome::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_spike_restores_snapshot() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_deployment("production", "demo-api", "demo-api:1.2.3-bad", 1);
        // Half the lines are errors: 1.5x a 1/3 baseline.
        cluster.push_logs(
            "production",
            &["ok", "ERROR timeout", "ok", "ERROR timeout", "ERROR timeout", "ok"],
        );

        let executor = Arc::new(FixExecutor::new(cluster.clone()));
        let watcher = RollbackWatcher::new(cluster.clone(), executor, fast_config());
        let resource = ResourceRef::new("production", ResourceKind::Deployment, "demo-api");

        let snapshot = serde_json::json!({
            "metadata": {"name": "demo-api", "namespace": "production"},
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": "demo-api"}},
                "template": {"metadata": {"labels": {"app": "demo-api"}},
                             "spec": {"containers": [{"name": "demo-api", "image": "demo-api:1.2.2"}]}}
            }
        });

        let outcome = watcher
            .watch(&resource, &snapshot, 0.33, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            RollbackOutcome::RolledBack {
                reason: REASON_ERROR_RATE.to_string()
            }
        );
        let manifest = cluster.deployment_manifest("production", "demo-api").unwrap();
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["image"],
            "demo-api:1.2.2"
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_watch() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_deployment("production", "demo-api", "demo-api:1.2.3", 1);
        let executor = Arc::new(FixExecutor::new(cluster.clone()));
        let watcher = RollbackWatcher::new(cluster, executor, fast_config());
        let resource = ResourceRef::new("production", ResourceKind::Deployment, "demo-api");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = watcher
            .watch(&resource, &serde_json::json!({}), 0.0, &cancel)
            .await;
        assert_eq!(outcome, RollbackOutcome::Cancelled);
    }
}
