//! Shadow workload health sampling
//!
//! Samples readiness, restart growth, and the log error rate on a fixed
//! cadence and folds them into the weighted health score.

use aegis_cluster::{ops, ClusterOps};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PASS_THRESHOLD: f64 = 0.8;

const READINESS_WEIGHT: f64 = 0.5;
const RESTART_WEIGHT: f64 = 0.3;
const ERROR_RATE_WEIGHT: f64 = 0.2;

/// One observation of the shadow workload
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub ready_ratio: f64,
    pub restart_count: i32,
    pub error_rate: f64,
}

/// Aggregated verdict over a monitoring window
#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub score: f64,
    pub passed: bool,
    pub samples: Vec<HealthSample>,
}

pub struct HealthMonitor {
    cluster: Arc<dyn ClusterOps>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(cluster: Arc<dyn ClusterOps>) -> Self {
        Self {
            cluster,
            interval: Duration::from_secs(5),
        }
    }

    /// Override the sampling cadence (tests use millisecond intervals).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sample the namespace for `duration` and score the window.
    pub async fn monitor(
        &self,
        namespace: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> HealthVerdict {
        let deadline = tokio::time::Instant::now() + duration;
        let mut samples = Vec::new();
        let mut baseline_restarts: Option<i32> = None;

        loop {
            let sample = self.sample(namespace).await;
            if baseline_restarts.is_none() {
                baseline_restarts = Some(sample.restart_count);
            }
            debug!(
                shadow_id = namespace,
                ready_ratio = sample.ready_ratio,
                restarts = sample.restart_count,
                error_rate = sample.error_rate,
                "health sample"
            );
            samples.push(sample);

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + self.interval)) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        let score = score_samples(&samples, baseline_restarts.unwrap_or(0));
        HealthVerdict {
            score,
            passed: score >= PASS_THRESHOLD,
            samples,
        }
    }

    async fn sample(&self, namespace: &str) -> HealthSample {
        let pods = self.cluster.list_pods(namespace, None).await.unwrap_or_default();
        let total = pods.len();
        let ready = pods.iter().filter(|p| ops::pod_is_ready(p)).count();
        let restart_count = pods.iter().map(ops::pod_restart_count).sum();
        let ready_ratio = if total == 0 {
            0.0
        } else {
            ready as f64 / total as f64
        };

        let error_rate = match pods.first().and_then(|p| p.metadata.name.clone()) {
            Some(pod_name) => self
                .cluster
                .pod_logs(namespace, &pod_name, 100, None)
                .await
                .map(|text| ops::log_error_rate(&text))
                .unwrap_or(0.0),
            None => 0.0,
        };

        HealthSample {
            at: Utc::now(),
            ready_ratio,
            restart_count,
            error_rate,
        }
    }
}

/// `readiness × 0.5 + restart_free × 0.3 + error_rate_inverse × 0.2`
pub fn score_samples(samples: &[HealthSample], baseline_restarts: i32) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    let readiness: f64 = samples.iter().map(|s| s.ready_ratio).sum::<f64>() / n;
    let restart_free = samples
        .iter()
        .filter(|s| s.restart_count <= baseline_restarts)
        .count() as f64
        / n;
    let avg_error_rate = samples.iter().map(|s| s.error_rate).sum::<f64>() / n;
    let error_rate_inverse = (1.0 - avg_error_rate).clamp(0.0, 1.0);

    readiness * READINESS_WEIGHT + restart_free * RESTART_WEIGHT + error_rate_inverse * ERROR_RATE_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ready: f64, restarts: i32, error_rate: f64) -> HealthSample {
        HealthSample {
            at: Utc::now(),
            ready_ratio: ready,
            restart_count: restarts,
            error_rate,
        }
    }

    #[test]
    fn perfect_window_scores_one() {
        let samples = vec![sample(1.0, 0, 0.0), sample(1.0, 0, 0.0)];
        assert!((score_samples(&samples, 0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn restart_growth_costs_the_restart_weight() {
        let samples = vec![sample(1.0, 0, 0.0), sample(1.0, 2, 0.0)];
        let score = score_samples(&samples, 0);
        assert!((score - (0.5 + 0.15 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn unready_pods_fail_threshold() {
        let samples = vec![sample(0.0, 0, 0.0); 3];
        let score = score_samples(&samples, 0);
        assert!(score < PASS_THRESHOLD);
    }

    #[test]
    fn empty_window_scores_zero() {
        assert_eq!(score_samples(&[], 0), 0.0);
    }
}
