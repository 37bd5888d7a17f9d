//! Dynamic web scanner
//!
//! Runs a containerized baseline scan against a service URL resolved from
//! the shadow namespace. Fail-open on a missing container runtime; high-risk
//! alerts in a completed scan block the gate.

use crate::scanner::{FailMode, ScanContext, Scanner};
use aegis_common::config::SecurityConfig;
use aegis_common::{ScanOutcome, SecurityFinding, Severity};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const SCANNER_ID: &str = "web";

const REPORT_FILE: &str = "scan-report.json";

pub struct WebScanner {
    runtime: String,
    scanner_image: String,
    timeout: Duration,
}

impl WebScanner {
    pub fn new(config: &SecurityConfig, runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            scanner_image: config.web_scan_image.clone(),
            timeout: Duration::from_secs(config.scanner_timeout_seconds),
        }
    }
}

#[async_trait]
impl Scanner for WebScanner {
    fn id(&self) -> &'static str {
        SCANNER_ID
    }

    fn fail_mode(&self) -> FailMode {
        FailMode::Open
    }

    fn should_run(&self, context: &ScanContext) -> bool {
        context.service_url.is_some()
    }

    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        let Some(url) = context.service_url.as_deref() else {
            return ScanOutcome::skipped(SCANNER_ID, "no service URL resolved");
        };

        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return ScanOutcome::skipped(SCANNER_ID, format!("no scratch directory: {}", e))
            }
        };

        debug!(url, runtime = %self.runtime, "running baseline web scan");
        let output = Command::new(&self.runtime)
            .arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/zap/wrk:rw", workdir.path().display()))
            .arg(&self.scanner_image)
            .arg("zap-baseline.py")
            .arg("-t")
            .arg(url)
            .arg("-J")
            .arg(REPORT_FILE)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let result = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(runtime = %self.runtime, "container runtime missing, skipping web scan");
                return ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("container runtime '{}' unavailable", self.runtime),
                );
            }
            Ok(Err(e)) => {
                return ScanOutcome::skipped(SCANNER_ID, format!("web scan failed to start: {}", e));
            }
            Err(_) => {
                return ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("web scan exceeded {:?}", self.timeout),
                );
            }
        };

        // Baseline scanners exit non-zero when they find alerts; the report
        // file is authoritative.
        let report_path = workdir.path().join(REPORT_FILE);
        let report_text = match tokio::fs::read_to_string(&report_path).await {
            Ok(text) => text,
            Err(e) => {
                let stderr = String::from_utf8_lossy(&result.stderr);
                return ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("no scan report produced ({}; stderr: {})", e, stderr),
                );
            }
        };

        match parse_web_report(&report_text) {
            Ok((findings, raw)) => {
                let blocking = findings
                    .iter()
                    .filter(|f| matches!(f.severity, Severity::Critical | Severity::High))
                    .count();
                let passed = blocking == 0;
                let summary = format!(
                    "{} alert(s), {} high-risk, against {}",
                    findings.len(),
                    blocking,
                    url
                );
                ScanOutcome {
                    tool: SCANNER_ID.to_string(),
                    passed,
                    skipped: false,
                    reason: (!passed).then(|| summary.clone()),
                    findings,
                    summary,
                    raw,
                }
            }
            Err(reason) => {
                ScanOutcome::skipped(SCANNER_ID, format!("unreadable scan report: {}", reason))
            }
        }
    }
}

fn risk_to_severity(risk: &str) -> Severity {
    match risk.split_whitespace().next().unwrap_or("") {
        "High" => Severity::High,
        "Medium" => Severity::Medium,
        "Low" => Severity::Low,
        _ => Severity::Info,
    }
}

/// Parse the normalized `alerts[]` report array.
pub fn parse_web_report(report: &str) -> Result<(Vec<SecurityFinding>, Value), String> {
    let raw: Value = serde_json::from_str(report).map_err(|e| e.to_string())?;
    let alerts = raw
        .get("alerts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let findings = alerts
        .into_iter()
        .map(|alert| {
            let risk = alert.get("risk").and_then(Value::as_str).unwrap_or("");
            let urls = alert
                .get("urls")
                .and_then(Value::as_array)
                .map(|u| {
                    u.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            SecurityFinding {
                scanner: SCANNER_ID.to_string(),
                severity: risk_to_severity(risk),
                title: alert
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("web alert")
                    .to_string(),
                identifier: risk.to_string(),
                location: urls,
                raw: alert,
            }
        })
        .collect();
    Ok((findings, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::ResourceKind;

    const SAMPLE_REPORT: &str = r#"{
        "alerts": [
            {"name": "X-Frame-Options Header Not Set", "risk": "Medium", "confidence": "Medium",
             "description": "clickjacking protection missing", "solution": "set the header",
             "urls": ["http://demo.shadow.svc:8080/"]},
            {"name": "SQL Injection", "risk": "High (certain)", "confidence": "High",
             "description": "injectable parameter", "solution": "parameterize queries",
             "urls": ["http://demo.shadow.svc:8080/search"]}
        ]
    }"#;

    #[test]
    fn parses_alert_risks() {
        let (findings, _) = parse_web_report(SAMPLE_REPORT).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[1].severity, Severity::High);
        assert!(findings[1].location.contains("/search"));
    }

    #[tokio::test]
    async fn missing_runtime_fails_open() {
        let config = SecurityConfig::default();
        let scanner = WebScanner::new(&config, "aegis-test-no-such-runtime");
        let mut context = ScanContext::new("shadow-ns", ResourceKind::Deployment);
        context.service_url = Some("http://demo.shadow-ns.svc:8080".to_string());

        let outcome = scanner.scan(&context).await;
        assert!(outcome.skipped);
        assert!(outcome.passed);
        assert!(outcome.reason.as_deref().unwrap().contains("unavailable"));
    }

    #[test]
    fn does_not_trigger_without_url() {
        let scanner = WebScanner::new(&SecurityConfig::default(), "docker");
        let context = ScanContext::new("shadow-ns", ResourceKind::Deployment);
        assert!(!scanner.should_run(&context));
    }
}
