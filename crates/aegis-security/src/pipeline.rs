//! The staged security gate chain
//!
//! Runs the scanners in a fixed order and aggregates their outcomes into a
//! single report. A scanner whose trigger condition does not hold produces
//! no outcome at all; one that could not produce a verdict reports
//! `skipped`, which the chain converts into a block when the scanner
//! declares itself fail-closed. `skipped` in the report means every scanner
//! that could run was skipped, and is never treated as a failure downstream.

use crate::image_scan::ImageScanner;
use crate::manifest_scan::ManifestScanner;
use crate::runtime_alerts::RuntimeAlertScanner;
use crate::scanner::{FailMode, ScanContext, Scanner};
use crate::web_scan::WebScanner;
use aegis_cluster::ClusterOps;
use aegis_common::config::{SecurityConfig, ShadowConfig};
use aegis_common::{metrics, ScanOutcome, SecurityReport, Severity};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SecurityPipeline {
    scanners: Vec<Arc<dyn Scanner>>,
}

impl SecurityPipeline {
    pub fn new(scanners: Vec<Arc<dyn Scanner>>) -> Self {
        Self { scanners }
    }

    /// The production chain: image → runtime alerts → web → manifest.
    pub fn from_config(
        security: &SecurityConfig,
        shadow: &ShadowConfig,
        cluster: Arc<dyn ClusterOps>,
    ) -> Self {
        let mut scanners: Vec<Arc<dyn Scanner>> = Vec::new();
        if security.image_scan_enabled {
            scanners.push(Arc::new(ImageScanner::new(security)));
        }
        if security.runtime_alerts_enabled {
            scanners.push(Arc::new(RuntimeAlertScanner::new(cluster, security)));
        }
        if security.web_scan_enabled {
            scanners.push(Arc::new(WebScanner::new(security, container_runtime(shadow))));
        }
        if security.manifest_scan_enabled {
            scanners.push(Arc::new(ManifestScanner::new(security)));
        }
        Self::new(scanners)
    }

    /// Run every triggered scanner in order and aggregate the verdict.
    pub async fn run(&self, context: &ScanContext) -> SecurityReport {
        let mut outcomes = Vec::new();
        for scanner in &self.scanners {
            if !scanner.should_run(context) {
                continue;
            }
            let mut outcome = scanner.scan(context).await;
            if outcome.skipped && scanner.fail_mode() == FailMode::Closed {
                let reason = outcome
                    .reason
                    .take()
                    .unwrap_or_else(|| "no scan verdict".to_string());
                warn!(
                    scanner = scanner.id(),
                    shadow_id = %context.shadow_namespace,
                    reason = %reason,
                    "fail-closed scanner produced no verdict, blocking"
                );
                outcome = ScanOutcome {
                    tool: outcome.tool,
                    passed: false,
                    skipped: false,
                    reason: Some(reason.clone()),
                    findings: Vec::new(),
                    summary: format!("fail-closed: {}", reason),
                    raw: outcome.raw,
                };
            }
            if !outcome.passed {
                let severity = outcome
                    .findings
                    .iter()
                    .map(|f| f.severity)
                    .min_by_key(|s| severity_rank(*s))
                    .map(|s| s.as_str().to_uppercase())
                    .unwrap_or_else(|| "UNAVAILABLE".to_string());
                warn!(
                    scanner = scanner.id(),
                    shadow_id = %context.shadow_namespace,
                    severity = %severity,
                    "security gate blocked"
                );
                metrics::security_block(scanner.id(), &severity);
            }
            outcomes.push(outcome);
        }
        let report = aggregate(outcomes);
        info!(
            shadow_id = %context.shadow_namespace,
            passed = report.passed,
            skipped = report.skipped,
            findings = report.findings.len(),
            "security gate chain finished"
        );
        report
    }
}

fn container_runtime(shadow: &ShadowConfig) -> String {
    // The shadow runtime doubles as the container runtime for tool
    // invocations; anything other than the namespace backend names a binary.
    if shadow.runtime == "namespace" {
        "docker".to_string()
    } else {
        shadow.runtime.clone()
    }
}

fn severity_rank(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 0,
        Severity::High => 1,
        Severity::Medium => 2,
        Severity::Low => 3,
        Severity::Info => 4,
    }
}

/// Fold scanner outcomes into one report.
pub fn aggregate(outcomes: Vec<ScanOutcome>) -> SecurityReport {
    if outcomes.is_empty() {
        return SecurityReport::empty();
    }

    let passed = outcomes.iter().all(|o| o.passed);
    let skipped = outcomes.iter().all(|o| o.skipped);
    let findings: Vec<_> = outcomes
        .iter()
        .flat_map(|o| o.findings.iter().cloned())
        .collect();

    let mut severity_counts: BTreeMap<String, usize> = BTreeMap::new();
    for finding in &findings {
        *severity_counts
            .entry(finding.severity.as_str().to_string())
            .or_insert(0) += 1;
    }

    let ran = outcomes.iter().filter(|o| !o.skipped).count();
    let summary = if skipped {
        "all applicable scanners skipped".to_string()
    } else if passed {
        format!("{} scanner(s) ran, no blocking findings", ran)
    } else {
        let blockers: Vec<_> = outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.tool.as_str())
            .collect();
        format!("blocked by {} ({} finding(s))", blockers.join(", "), findings.len())
    };

    SecurityReport {
        passed,
        skipped,
        outcomes,
        findings,
        severity_counts,
        summary,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::{ResourceKind, SecurityFinding};
    use async_trait::async_trait;

    struct ScriptedScanner {
        id: &'static str,
        trigger: bool,
        fail_mode: FailMode,
        outcome: ScanOutcome,
    }

    #[async_trait]
    impl Scanner for ScriptedScanner {
        fn id(&self) -> &'static str {
            self.id
        }
        fn fail_mode(&self) -> FailMode {
            self.fail_mode
        }
        fn should_run(&self, _context: &ScanContext) -> bool {
            self.trigger
        }
        async fn scan(&self, _context: &ScanContext) -> ScanOutcome {
            self.outcome.clone()
        }
    }

    fn passing(tool: &str) -> ScanOutcome {
        ScanOutcome {
            tool: tool.to_string(),
            passed: true,
            skipped: false,
            reason: None,
            findings: Vec::new(),
            summary: "clean".to_string(),
            raw: serde_json::Value::Null,
        }
    }

    fn blocking(tool: &str, severity: Severity) -> ScanOutcome {
        ScanOutcome {
            tool: tool.to_string(),
            passed: false,
            skipped: false,
            reason: Some("findings".to_string()),
            findings: vec![SecurityFinding {
                scanner: tool.to_string(),
                severity,
                title: "finding".to_string(),
                identifier: "X-1".to_string(),
                location: "here".to_string(),
                raw: serde_json::Value::Null,
            }],
            summary: "bad".to_string(),
            raw: serde_json::Value::Null,
        }
    }

    fn context() -> ScanContext {
        ScanContext::new("aegis-shadow-test", ResourceKind::Deployment)
    }

    #[tokio::test]
    async fn one_blocking_outcome_fails_the_report() {
        let pipeline = SecurityPipeline::new(vec![
            Arc::new(ScriptedScanner {
                id: "image",
                trigger: true,
                fail_mode: FailMode::Closed,
                outcome: blocking("image", Severity::Critical),
            }),
            Arc::new(ScriptedScanner {
                id: "runtime-alerts",
                trigger: true,
                fail_mode: FailMode::Open,
                outcome: passing("runtime-alerts"),
            }),
        ]);
        let report = pipeline.run(&context()).await;
        assert!(!report.passed);
        assert!(!report.skipped);
        assert_eq!(report.severity_counts["critical"], 1);
        assert!(report.summary.contains("image"));
    }

    #[tokio::test]
    async fn all_skipped_reports_skipped_not_failed() {
        let pipeline = SecurityPipeline::new(vec![Arc::new(ScriptedScanner {
            id: "runtime-alerts",
            trigger: true,
            fail_mode: FailMode::Open,
            outcome: ScanOutcome::skipped("runtime-alerts", "tool missing"),
        })]);
        let report = pipeline.run(&context()).await;
        assert!(report.passed);
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn untriggered_scanners_leave_no_outcome() {
        let pipeline = SecurityPipeline::new(vec![Arc::new(ScriptedScanner {
            id: "image",
            trigger: false,
            fail_mode: FailMode::Closed,
            outcome: blocking("image", Severity::Critical),
        })]);
        let report = pipeline.run(&context()).await;
        assert!(report.passed);
        assert!(report.skipped);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn skipped_and_ran_mix_is_not_skipped() {
        let report = aggregate(vec![
            ScanOutcome::skipped("runtime-alerts", "source missing"),
            passing("manifest"),
        ]);
        assert!(report.passed);
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn fail_mode_governs_verdictless_scanners() {
        // Fail-open scanner with no verdict: the report stays skipped.
        let open = SecurityPipeline::new(vec![Arc::new(ScriptedScanner {
            id: "runtime-alerts",
            trigger: true,
            fail_mode: FailMode::Open,
            outcome: ScanOutcome::skipped("runtime-alerts", "no pods"),
        })]);
        let report = open.run(&context()).await;
        assert!(report.passed);
        assert!(report.skipped);

        // Fail-closed scanner with no verdict: the chain blocks.
        let closed = SecurityPipeline::new(vec![Arc::new(ScriptedScanner {
            id: "image",
            trigger: true,
            fail_mode: FailMode::Closed,
            outcome: ScanOutcome::skipped("image", "scanner unavailable"),
        })]);
        let report = closed.run(&context()).await;
        assert!(!report.passed);
        assert!(!report.skipped);
        assert!(report.outcomes[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("unavailable"));
    }
}
