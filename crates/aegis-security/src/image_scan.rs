//! Image vulnerability scanner
//!
//! Wraps the external image scanner (`<tool> image --format json
//! --severity <csv> <ref>`). The scanner reports findings, a clean pass, or
//! `skipped` when it could not produce a verdict; declaring
//! `FailMode::Closed` makes the gate chain block on the skipped case, so an
//! unscannable image never reaches production.

use crate::scanner::{FailMode, ScanContext, Scanner};
use aegis_common::config::SecurityConfig;
use aegis_common::{ScanOutcome, SecurityFinding, Severity};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const SCANNER_ID: &str = "image";

pub struct ImageScanner {
    tool: String,
    severity_filter: String,
    timeout: Duration,
}

impl ImageScanner {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            tool: config.image_scan_tool.clone(),
            severity_filter: config.image_scan_severity.clone(),
            timeout: Duration::from_secs(config.scanner_timeout_seconds),
        }
    }
}

#[async_trait]
impl Scanner for ImageScanner {
    fn id(&self) -> &'static str {
        SCANNER_ID
    }

    fn fail_mode(&self) -> FailMode {
        FailMode::Closed
    }

    fn should_run(&self, context: &ScanContext) -> bool {
        context.image.is_some()
    }

    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        let Some(image) = context.image.as_deref() else {
            return ScanOutcome::skipped(self.tool.clone(), "no image change");
        };

        debug!(image, tool = %self.tool, "scanning image");
        let output = Command::new(&self.tool)
            .arg("image")
            .arg("--format")
            .arg("json")
            .arg("--severity")
            .arg(&self.severity_filter)
            .arg(image)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(tool = %self.tool, "image scanner missing");
                return ScanOutcome::skipped(
                    self.tool.clone(),
                    format!("image scanner '{}' unavailable", self.tool),
                );
            }
            Ok(Err(e)) => {
                return ScanOutcome::skipped(
                    self.tool.clone(),
                    format!("image scanner failed to start: {}", e),
                );
            }
            Err(_) => {
                return ScanOutcome::skipped(
                    self.tool.clone(),
                    format!("image scan exceeded {:?}", self.timeout),
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ScanOutcome::skipped(
                self.tool.clone(),
                format!("image scanner exited with {}: {}", output.status, stderr),
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_image_report(&stdout, image) {
            Ok((findings, raw)) => {
                let passed = findings.is_empty();
                let summary = if passed {
                    format!("no vulnerabilities at [{}] in {}", self.severity_filter, image)
                } else {
                    format!("{} vulnerability finding(s) in {}", findings.len(), image)
                };
                ScanOutcome {
                    tool: self.tool.clone(),
                    passed,
                    skipped: false,
                    reason: (!passed).then(|| summary.clone()),
                    findings,
                    summary,
                    raw,
                }
            }
            Err(reason) => ScanOutcome::skipped(
                self.tool.clone(),
                format!("unreadable image scan report: {}", reason),
            ),
        }
    }
}

/// Parse the scanner's `Results[].Vulnerabilities[]` report shape.
pub fn parse_image_report(
    stdout: &str,
    image: &str,
) -> Result<(Vec<SecurityFinding>, Value), String> {
    let raw: Value = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let mut findings = Vec::new();
    let results = raw.get("Results").and_then(Value::as_array).cloned().unwrap_or_default();
    for result in results {
        let location = result
            .get("Target")
            .and_then(Value::as_str)
            .unwrap_or(image)
            .to_string();
        let vulnerabilities = result
            .get("Vulnerabilities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for vulnerability in vulnerabilities {
            let severity = vulnerability
                .get("Severity")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Severity>().ok())
                .unwrap_or(Severity::Info);
            findings.push(SecurityFinding {
                scanner: SCANNER_ID.to_string(),
                severity,
                title: vulnerability
                    .get("Title")
                    .and_then(Value::as_str)
                    .unwrap_or("vulnerability")
                    .to_string(),
                identifier: vulnerability
                    .get("VulnerabilityID")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                location: location.clone(),
                raw: vulnerability,
            });
        }
    }
    Ok((findings, raw))
}
