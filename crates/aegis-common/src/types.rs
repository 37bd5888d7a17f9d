//! Core domain types shared across the AEGIS pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for incidents
pub type IncidentId = Uuid;

/// Kind of a managed cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ResourceKind {
    Deployment,
    Pod,
    Service,
    Other(String),
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.to_string()
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => ResourceKind::Deployment,
            "pod" | "pods" | "po" => ResourceKind::Pod,
            "service" | "services" | "svc" => ResourceKind::Service,
            _ => ResourceKind::Other(s),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Deployment => write!(f, "Deployment"),
            ResourceKind::Pod => write!(f, "Pod"),
            ResourceKind::Service => write!(f, "Service"),
            ResourceKind::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Reference to a namespaced cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// Parse a kubectl-style `kind/name` reference.
    pub fn parse(spec: &str, namespace: &str) -> Result<Self, String> {
        let mut parts = spec.splitn(2, '/');
        let kind = parts.next().unwrap_or_default().trim();
        let name = parts.next().unwrap_or_default().trim();
        if kind.is_empty() || name.is_empty() {
            return Err(format!("malformed resource reference '{}', expected kind/name", spec));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            kind: ResourceKind::from(kind.to_string()),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Incident priority, `P0` highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::P0,
        Priority::P1,
        Priority::P2,
        Priority::P3,
        Priority::P4,
    ];

    /// Numeric rank, 0 is most urgent.
    pub fn rank(self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
            Priority::P4 => 4,
        }
    }

    /// The more urgent of the two priorities.
    pub fn promote(self, other: Priority) -> Priority {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity used for analysis results and security findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Severities in {critical, high} route fixes through verification.
    pub fn requires_verification(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" | "moderate" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" | "informational" | "unknown" => Ok(Severity::Info),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fault signal that triggered an incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSignal {
    PhaseTransition { phase: String },
    ReplicaShortfall { ready: i32, desired: i32 },
    ProbeFailure { probe: String },
    OomKill,
}

impl fmt::Display for TriggerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSignal::PhaseTransition { phase } => write!(f, "phase transition to {}", phase),
            TriggerSignal::ReplicaShortfall { ready, desired } => {
                write!(f, "replica shortfall {}/{}", ready, desired)
            }
            TriggerSignal::ProbeFailure { probe } => write!(f, "{} probe failure", probe),
            TriggerSignal::OomKill => write!(f, "OOM kill"),
        }
    }
}

/// Incident lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentStatus {
    Queued,
    Claimed,
    Analyzing,
    AwaitingApproval,
    Applying,
    Resolved,
    Rejected,
    Failed,
}

impl IncidentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IncidentStatus::Resolved | IncidentStatus::Rejected | IncidentStatus::Failed
        )
    }

    /// States that hold the correlation-key lock for their namespace.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            IncidentStatus::Claimed
                | IncidentStatus::Analyzing
                | IncidentStatus::AwaitingApproval
                | IncidentStatus::Applying
        )
    }
}

/// A detected fault with a stable correlation identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub correlation_key: String,
    pub priority: Priority,
    pub severity: Severity,
    pub resource: ResourceRef,
    pub detected_at: DateTime<Utc>,
    pub trigger: TriggerSignal,
    pub occurrences: u32,
    pub status: IncidentStatus,
    /// Raw context captured at detection time, opaque to the queue.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl Incident {
    pub fn new(
        resource: ResourceRef,
        priority: Priority,
        severity: Severity,
        trigger: TriggerSignal,
    ) -> Self {
        let correlation_key = crate::utils::correlation_key(&resource);
        Self {
            id: Uuid::new_v4(),
            correlation_key,
            priority,
            severity,
            resource,
            detected_at: Utc::now(),
            trigger,
            occurrences: 1,
            status: IncidentStatus::Queued,
            context: serde_json::Value::Null,
        }
    }
}

/// One normalized finding from the diagnostic tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticFinding {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Normalized diagnostic bundle attached to an incident.
///
/// Immutable once built; the collector returns a partial context with
/// `errors` populated rather than failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultContext {
    pub resource: ResourceRef,
    pub findings: Vec<DiagnosticFinding>,
    pub log_tail: Vec<String>,
    pub events: Vec<String>,
    pub manifest: Option<String>,
    pub errors: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl FaultContext {
    pub fn empty(resource: ResourceRef) -> Self {
        Self {
            resource,
            findings: Vec::new(),
            log_tail: Vec::new(),
            events: Vec::new(),
            manifest: None,
            errors: Vec::new(),
            collected_at: Utc::now(),
        }
    }

    /// All error strings across the context and its findings.
    pub fn all_errors(&self) -> Vec<&str> {
        self.errors
            .iter()
            .map(String::as_str)
            .chain(
                self.findings
                    .iter()
                    .flat_map(|f| f.errors.iter().map(String::as_str)),
            )
            .collect()
    }
}

/// Root-cause analysis result produced by the RCA stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaResult {
    pub root_cause: String,
    #[serde(default)]
    pub contributing_factors: Vec<String>,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub analysis_steps: Vec<String>,
    #[serde(default)]
    pub evidence_summary: Vec<String>,
    #[serde(default)]
    pub decision_rationale: String,
}

/// Category of a proposed remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixKind {
    ConfigChange,
    Restart,
    Scale,
    Rollback,
    Patch,
    Manual,
}

impl fmt::Display for FixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixKind::ConfigChange => "config-change",
            FixKind::Restart => "restart",
            FixKind::Scale => "scale",
            FixKind::Rollback => "rollback",
            FixKind::Patch => "patch",
            FixKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Candidate remediation produced by the fix stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    pub kind: FixKind,
    pub description: String,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Manifest name to YAML text.
    #[serde(default)]
    pub manifests: BTreeMap<String, String>,
    #[serde(default)]
    pub rollback_commands: Vec<String>,
    #[serde(default)]
    pub estimated_downtime: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub analysis_steps: Vec<String>,
    #[serde(default)]
    pub decision_rationale: String,
}

impl FixProposal {
    /// No-op proposal used when analysis cannot produce an actionable fix.
    pub fn manual(description: impl Into<String>) -> Self {
        Self {
            kind: FixKind::Manual,
            description: description.into(),
            commands: Vec::new(),
            manifests: BTreeMap::new(),
            rollback_commands: Vec::new(),
            estimated_downtime: String::new(),
            risks: Vec::new(),
            prerequisites: Vec::new(),
            confidence: 0.0,
            analysis_steps: Vec::new(),
            decision_rationale: String::new(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        !self.commands.is_empty() || !self.manifests.is_empty()
    }

    /// New container image reference carried by this proposal, if any.
    pub fn proposed_image(&self) -> Option<String> {
        for cmd in &self.commands {
            if let Some(pos) = cmd.find("--image=") {
                let rest = &cmd[pos + "--image=".len()..];
                let image = rest.split_whitespace().next().unwrap_or_default();
                if !image.is_empty() {
                    return Some(image.to_string());
                }
            }
        }
        for manifest in self.manifests.values() {
            for line in manifest.lines() {
                let trimmed = line.trim();
                if let Some(rest) = trimmed.strip_prefix("image:") {
                    let image = rest.trim().trim_matches('"').trim_matches('\'');
                    if !image.is_empty() {
                        return Some(image.to_string());
                    }
                }
            }
        }
        None
    }
}

/// Load generation settings for shadow verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    #[serde(default)]
    pub target_url: Option<String>,
    pub requests_per_second: u32,
    pub duration_seconds: u64,
}

/// Verification plan produced by the verify stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPlan {
    pub verification_type: String,
    #[serde(default)]
    pub test_scenarios: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    pub duration_seconds: u64,
    #[serde(default)]
    pub load_test_config: Option<LoadTestConfig>,
    #[serde(default)]
    pub security_checks: Vec<String>,
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub analysis_steps: Vec<String>,
    #[serde(default)]
    pub decision_rationale: String,
}

/// Analysis stage identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Rca,
    Fix,
    Verify,
    Shadow,
    Apply,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Rca => "rca",
            PipelineStage::Fix => "fix",
            PipelineStage::Verify => "verify",
            PipelineStage::Shadow => "shadow",
            PipelineStage::Apply => "apply",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the append-only pipeline trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMessage {
    pub stage: PipelineStage,
    pub at: DateTime<Utc>,
    pub body: String,
}

/// Shared state for one incident's trip through the pipeline.
///
/// `messages` is append-only; earlier entries are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub incident_id: IncidentId,
    pub correlation_key: String,
    pub resource: ResourceRef,
    pub fault_context: Option<FaultContext>,
    pub rca_result: Option<RcaResult>,
    pub fix_proposal: Option<FixProposal>,
    pub verification_plan: Option<VerificationPlan>,
    pub current_stage: PipelineStage,
    pub error: Option<String>,
    pub shadow_env_id: Option<String>,
    pub shadow_passed: Option<bool>,
    pub shadow_logs: Vec<String>,
    pub security_report: Option<SecurityReport>,
    messages: Vec<StageMessage>,
}

impl PipelineState {
    pub fn new(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id,
            correlation_key: incident.correlation_key.clone(),
            resource: incident.resource.clone(),
            fault_context: None,
            rca_result: None,
            fix_proposal: None,
            verification_plan: None,
            current_stage: PipelineStage::Rca,
            error: None,
            shadow_env_id: None,
            shadow_passed: None,
            shadow_logs: Vec::new(),
            security_report: None,
            messages: Vec::new(),
        }
    }

    /// Append a trace message. This is the only mutation of the trace.
    pub fn push_message(&mut self, stage: PipelineStage, body: impl Into<String>) {
        self.messages.push(StageMessage {
            stage,
            at: Utc::now(),
            body: body.into(),
        });
    }

    pub fn messages(&self) -> &[StageMessage] {
        &self.messages
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Shadow environment lifecycle status.
///
/// Transitions only move forward in declaration order; `Failed` and
/// `Destroyed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowStatus {
    Pending,
    Creating,
    Ready,
    Testing,
    Failed,
    Cleaning,
    Destroyed,
}

impl ShadowStatus {
    fn rank(self) -> u8 {
        match self {
            ShadowStatus::Pending => 0,
            ShadowStatus::Creating => 1,
            ShadowStatus::Ready => 2,
            ShadowStatus::Testing => 3,
            ShadowStatus::Failed => 4,
            ShadowStatus::Cleaning => 5,
            ShadowStatus::Destroyed => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ShadowStatus::Failed | ShadowStatus::Destroyed)
    }

    /// Whether the status may move to `to`.
    pub fn can_transition(self, to: ShadowStatus) -> bool {
        !self.is_terminal() && to.rank() > self.rank()
    }
}

impl fmt::Display for ShadowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShadowStatus::Pending => "pending",
            ShadowStatus::Creating => "creating",
            ShadowStatus::Ready => "ready",
            ShadowStatus::Testing => "testing",
            ShadowStatus::Failed => "failed",
            ShadowStatus::Cleaning => "cleaning",
            ShadowStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// An isolated, ephemeral clone of a workload under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowEnvironment {
    pub id: String,
    pub namespace: String,
    pub source_namespace: String,
    pub source_name: String,
    pub source_kind: ResourceKind,
    pub status: ShadowStatus,
    pub created_at: DateTime<Utc>,
    pub health_score: f64,
    pub logs: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub test_results: BTreeMap<String, serde_json::Value>,
}

impl ShadowEnvironment {
    /// Move the status forward, ignoring backward or terminal-escaping writes.
    pub fn transition(&mut self, to: ShadowStatus) -> bool {
        if self.status.can_transition(to) {
            self.status = to;
            true
        } else {
            false
        }
    }
}

/// One normalized finding from a security scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub scanner: String,
    pub severity: Severity,
    pub title: String,
    pub identifier: String,
    pub location: String,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Result of a single scanner run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub tool: String,
    pub passed: bool,
    pub skipped: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub findings: Vec<SecurityFinding>,
    pub summary: String,
    /// Raw scanner payload, carried opaquely.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ScanOutcome {
    pub fn skipped(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            tool: tool.into(),
            passed: true,
            skipped: true,
            reason: Some(reason.clone()),
            findings: Vec::new(),
            summary: format!("skipped: {}", reason),
            raw: serde_json::Value::Null,
        }
    }
}

/// Aggregate verdict of the security gate chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub passed: bool,
    /// True only when every scanner that could run was skipped.
    pub skipped: bool,
    pub outcomes: Vec<ScanOutcome>,
    pub findings: Vec<SecurityFinding>,
    pub severity_counts: BTreeMap<String, usize>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl SecurityReport {
    /// Report for a chain where nothing needed to run.
    pub fn empty() -> Self {
        Self {
            passed: true,
            skipped: true,
            outcomes: Vec::new(),
            findings: Vec::new(),
            severity_counts: BTreeMap::new(),
            summary: "no scanners ran".to_string(),
            timestamp: Utc::now(),
        }
    }
}
