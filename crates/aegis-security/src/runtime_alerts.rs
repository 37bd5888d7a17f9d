//! Runtime alert scanner
//!
//! Tails the alert source (a falco-style detector running in its own
//! namespace) for alerts raised against the shadow namespace since
//! verification started. Fail-open: a missing alert source yields `skipped`
//! and never blocks the gate.

use crate::scanner::{FailMode, ScanContext, Scanner};
use crate::severity::AlertPriority;
use aegis_common::config::SecurityConfig;
use aegis_cluster::ClusterOps;
use aegis_common::{ScanOutcome, SecurityFinding};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SCANNER_ID: &str = "runtime-alerts";

const ALERT_LOG_TAIL: i64 = 500;

pub struct RuntimeAlertScanner {
    cluster: Arc<dyn ClusterOps>,
    source_namespace: String,
    selector: String,
    threshold: AlertPriority,
}

impl RuntimeAlertScanner {
    pub fn new(cluster: Arc<dyn ClusterOps>, config: &SecurityConfig) -> Self {
        let threshold = config
            .runtime_alerts_severity
            .parse()
            .unwrap_or(AlertPriority::Warning);
        Self {
            cluster,
            source_namespace: config.runtime_alerts_source_namespace.clone(),
            selector: config.runtime_alerts_selector.clone(),
            threshold,
        }
    }
}

#[async_trait]
impl Scanner for RuntimeAlertScanner {
    fn id(&self) -> &'static str {
        SCANNER_ID
    }

    fn fail_mode(&self) -> FailMode {
        FailMode::Open
    }

    fn should_run(&self, _context: &ScanContext) -> bool {
        true
    }

    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        let pods = match self
            .cluster
            .list_pods(&self.source_namespace, Some(&self.selector))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "alert source unreachable, skipping runtime scan");
                return ScanOutcome::skipped(SCANNER_ID, format!("alert source unreachable: {}", e));
            }
        };
        if pods.is_empty() {
            debug!(
                namespace = %self.source_namespace,
                selector = %self.selector,
                "no alert source pods, skipping runtime scan"
            );
            return ScanOutcome::skipped(SCANNER_ID, "no alert source pods found");
        }

        let since_seconds = (Utc::now() - context.verification_start).num_seconds().max(1);
        let mut findings = Vec::new();
        let mut scanned_lines = 0usize;
        for pod in pods {
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            let text = match self
                .cluster
                .pod_logs(&self.source_namespace, &pod_name, ALERT_LOG_TAIL, Some(since_seconds))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "alert log tail failed");
                    continue;
                }
            };
            for line in text.lines() {
                if !line.contains(&context.shadow_namespace) {
                    continue;
                }
                scanned_lines += 1;
                if let Some(finding) = parse_alert_line(line, self.threshold) {
                    findings.push(finding);
                }
            }
        }

        let passed = findings.is_empty();
        let summary = if passed {
            format!(
                "no runtime alerts at or above {} across {} matching line(s)",
                self.threshold, scanned_lines
            )
        } else {
            format!("{} runtime alert(s) at or above {}", findings.len(), self.threshold)
        };
        ScanOutcome {
            tool: SCANNER_ID.to_string(),
            passed,
            skipped: false,
            reason: (!passed).then(|| summary.clone()),
            findings,
            summary,
            raw: json!({"scanned_lines": scanned_lines}),
        }
    }
}

/// Parse one alert line (JSON or free text) into a blocking finding when its
/// priority meets the threshold.
pub fn parse_alert_line(line: &str, threshold: AlertPriority) -> Option<SecurityFinding> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (priority, rule, output, raw) =
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            let priority = value
                .get("priority")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<AlertPriority>().ok())?;
            let rule = value
                .get("rule")
                .and_then(Value::as_str)
                .unwrap_or("runtime alert")
                .to_string();
            let output = value
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or(trimmed)
                .to_string();
            (priority, rule, output, value)
        } else {
            let priority = trimmed
                .split_whitespace()
                .find_map(|token| token.trim_matches(':').parse::<AlertPriority>().ok())?;
            (priority, "runtime alert".to_string(), trimmed.to_string(), Value::String(trimmed.to_string()))
        };

    if !priority.meets_threshold(threshold) {
        return None;
    }
    Some(SecurityFinding {
        scanner: SCANNER_ID.to_string(),
        severity: priority.as_severity(),
        title: rule,
        identifier: priority.as_str().to_string(),
        location: output,
        raw,
    })
}
