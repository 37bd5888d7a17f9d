//! Apply approval gate
//!
//! Before an approved fix touches the source namespace an approver signs it
//! off. The terminal approver prompts interactively; the static approver
//! backs `--auto-fix` runs and tests; policy decides when a prompt is
//! needed at all.

use aegis_common::config::ApprovalPolicy;
use aegis_common::{Incident, PipelineState};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approved,
    Rejected(String),
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn request(&self, incident: &Incident, state: &PipelineState) -> ApprovalDecision;
}

/// Whether this proposal needs an approver at all under the policy.
pub fn approval_required(
    policy: ApprovalPolicy,
    is_production: bool,
    state: &PipelineState,
) -> bool {
    let plan_requires = state
        .verification_plan
        .as_ref()
        .map(|p| p.approval_required)
        .unwrap_or(false);
    let has_risks = state
        .fix_proposal
        .as_ref()
        .map(|f| !f.risks.is_empty())
        .unwrap_or(false);
    match policy {
        ApprovalPolicy::Always => true,
        ApprovalPolicy::ProductionOnly => is_production || plan_requires,
        ApprovalPolicy::AutoWhenSafe => is_production || has_risks || plan_requires,
    }
}

/// Render the proposal summary shown to an approver.
pub fn render_proposal(incident: &Incident, state: &PipelineState) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "incident {} ({}) on {}\n",
        incident.id, incident.correlation_key, incident.resource
    ));
    if let Some(rca) = &state.rca_result {
        out.push_str(&format!(
            "root cause [{} @ {:.2}]: {}\n",
            rca.severity, rca.confidence, rca.root_cause
        ));
    }
    if let Some(fix) = &state.fix_proposal {
        out.push_str(&format!("fix ({}): {}\n", fix.kind, fix.description));
        for command in &fix.commands {
            out.push_str(&format!("  $ {}\n", command));
        }
        for name in fix.manifests.keys() {
            out.push_str(&format!("  manifest: {}\n", name));
        }
        if !fix.risks.is_empty() {
            out.push_str(&format!("risks: {}\n", fix.risks.join("; ")));
        }
    }
    if let Some(passed) = state.shadow_passed {
        out.push_str(&format!("shadow verification passed: {}\n", passed));
    }
    if let Some(report) = &state.security_report {
        out.push_str(&format!("security gate: {}\n", report.summary));
    }
    out
}

/// Interactive terminal prompt with a timeout
pub struct TerminalApprover {
    timeout: Duration,
}

impl TerminalApprover {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Approver for TerminalApprover {
    async fn request(&self, incident: &Incident, state: &PipelineState) -> ApprovalDecision {
        println!("{}", render_proposal(incident, state));
        println!("apply this fix? [y/N] ");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        let read = tokio::time::timeout(self.timeout, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(_)) => {
                let answer = line.trim().to_ascii_lowercase();
                if answer == "y" || answer == "yes" {
                    info!(incident_id = %incident.id, "fix approved by operator");
                    ApprovalDecision::Approved
                } else {
                    ApprovalDecision::Rejected("declined by operator".to_string())
                }
            }
            Ok(Err(e)) => ApprovalDecision::Rejected(format!("approval input failed: {}", e)),
            Err(_) => {
                warn!(incident_id = %incident.id, "approval prompt timed out");
                ApprovalDecision::Rejected("approval timed out".to_string())
            }
        }
    }
}

/// Fixed-answer approver for `--auto-fix` runs and tests
pub struct StaticApprover {
    approve: bool,
}

impl StaticApprover {
    pub fn approving() -> Self {
        Self { approve: true }
    }

    pub fn rejecting() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl Approver for StaticApprover {
    async fn request(&self, incident: &Incident, _state: &PipelineState) -> ApprovalDecision {
        if self.approve {
            info!(incident_id = %incident.id, "fix auto-approved");
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected("auto-rejected".to_string())
        }
    }
}
