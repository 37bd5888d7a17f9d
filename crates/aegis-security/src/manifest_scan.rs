//! Pre-deploy manifest scanner
//!
//! Feeds the fix proposal's manifests to the external scanner over stdin and
//! blocks on critical findings when configured. Fail-open on a missing tool.

use crate::scanner::{FailMode, ScanContext, Scanner};
use aegis_common::config::SecurityConfig;
use aegis_common::{ScanOutcome, SecurityFinding, Severity};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const SCANNER_ID: &str = "manifest";

pub struct ManifestScanner {
    tool: String,
    block_on_critical: bool,
    timeout: Duration,
}

impl ManifestScanner {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            tool: config.manifest_scan_tool.clone(),
            block_on_critical: config.manifest_scan_block_on_critical,
            timeout: Duration::from_secs(config.scanner_timeout_seconds),
        }
    }

    async fn scan_one(&self, name: &str, manifest: &str) -> Result<Vec<SecurityFinding>, ScanOutcome> {
        let mut child = match Command::new(&self.tool)
            .arg("scan")
            .arg("/dev/stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(tool = %self.tool, "manifest scanner missing, skipping");
                return Err(ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("manifest scanner '{}' unavailable", self.tool),
                ));
            }
            Err(e) => {
                return Err(ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("manifest scanner failed to start: {}", e),
                ));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(manifest.as_bytes()).await {
                warn!(manifest = name, error = %e, "failed to feed manifest to scanner");
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("manifest scanner failed: {}", e),
                ));
            }
            Err(_) => {
                return Err(ScanOutcome::skipped(
                    SCANNER_ID,
                    format!("manifest scan exceeded {:?}", self.timeout),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_manifest_report(&stdout, name).map_err(|reason| {
            ScanOutcome::skipped(SCANNER_ID, format!("unreadable manifest report: {}", reason))
        })
    }
}

#[async_trait]
impl Scanner for ManifestScanner {
    fn id(&self) -> &'static str {
        SCANNER_ID
    }

    fn fail_mode(&self) -> FailMode {
        FailMode::Open
    }

    fn should_run(&self, context: &ScanContext) -> bool {
        !context.manifests.is_empty()
    }

    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        let mut findings = Vec::new();
        for (name, manifest) in &context.manifests {
            debug!(manifest = %name, tool = %self.tool, "scanning manifest");
            match self.scan_one(name, manifest).await {
                Ok(mut batch) => findings.append(&mut batch),
                Err(skip) => return skip,
            }
        }

        let critical = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        let passed = !self.block_on_critical || critical == 0;
        let summary = format!(
            "{} finding(s) across {} manifest(s), {} critical",
            findings.len(),
            context.manifests.len(),
            critical
        );
        ScanOutcome {
            tool: self.tool.clone(),
            passed,
            skipped: false,
            reason: (!passed).then(|| summary.clone()),
            findings,
            summary,
            raw: Value::Null,
        }
    }
}

/// Parse the scanner's JSON output: an array of per-document results with
/// `scoring.critical[]` entries.
pub fn parse_manifest_report(stdout: &str, manifest_name: &str) -> Result<Vec<SecurityFinding>, String> {
    let raw: Value = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let documents = match &raw {
        Value::Array(docs) => docs.clone(),
        other => vec![other.clone()],
    };

    let mut findings = Vec::new();
    for document in documents {
        let critical = document
            .get("scoring")
            .and_then(|s| s.get("critical"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in critical {
            findings.push(SecurityFinding {
                scanner: SCANNER_ID.to_string(),
                severity: Severity::Critical,
                title: entry
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("critical manifest issue")
                    .to_string(),
                identifier: entry
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                location: format!(
                    "{}: {}",
                    manifest_name,
                    entry.get("selector").and_then(Value::as_str).unwrap_or("")
                ),
                raw: entry,
            });
        }
    }
    Ok(findings)
}
