//! Metric instruments emitted by the AEGIS pipeline
//!
//! A fixed instrument set at stable names, recorded through the `metrics`
//! facade so any exporter installed by the binary picks them up.

use crate::types::{Priority, ResourceKind, Severity};

pub const INCIDENTS_DETECTED_TOTAL: &str = "incidents_detected_total";
pub const INCIDENT_QUEUE_DEPTH: &str = "incident_queue_depth";
pub const FIXES_APPLIED_TOTAL: &str = "fixes_applied_total";
pub const SHADOW_VERIFICATIONS_TOTAL: &str = "shadow_verifications_total";
pub const SHADOW_ENVIRONMENTS_ACTIVE: &str = "shadow_environments_active";
pub const SHADOW_NAMESPACES_LEAKED: &str = "shadow_namespaces_leaked";
pub const SHADOW_RETRIES_TOTAL: &str = "shadow_retries_total";
pub const SECURITY_BLOCKS_TOTAL: &str = "security_blocks_total";
pub const ROLLBACKS_TOTAL: &str = "rollbacks_total";
pub const INCIDENT_ANALYSIS_DURATION_SECONDS: &str = "incident_analysis_duration_seconds";

pub fn incident_detected(severity: Severity, kind: &ResourceKind, namespace: &str) {
    metrics::counter!(
        INCIDENTS_DETECTED_TOTAL,
        "severity" => severity.as_str(),
        "kind" => kind.to_string(),
        "namespace" => namespace.to_string()
    )
    .increment(1);
}

pub fn queue_depth(priority: Priority, depth: usize) {
    metrics::gauge!(INCIDENT_QUEUE_DEPTH, "priority" => priority.as_str()).set(depth as f64);
}

pub fn fix_applied(kind: &str, namespace: &str, success: bool) {
    metrics::counter!(
        FIXES_APPLIED_TOTAL,
        "kind" => kind.to_string(),
        "namespace" => namespace.to_string(),
        "success" => if success { "true" } else { "false" }
    )
    .increment(1);
}

pub fn shadow_verification(result: &str, kind: &ResourceKind) {
    metrics::counter!(
        SHADOW_VERIFICATIONS_TOTAL,
        "result" => result.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn shadow_active(runtime: &str, count: usize) {
    metrics::gauge!(SHADOW_ENVIRONMENTS_ACTIVE, "runtime" => runtime.to_string())
        .set(count as f64);
}

pub fn shadow_leaked(runtime: &str) {
    metrics::gauge!(SHADOW_NAMESPACES_LEAKED, "runtime" => runtime.to_string()).increment(1.0);
}

pub fn shadow_retry(outcome: &str, attempt: u32) {
    metrics::counter!(
        SHADOW_RETRIES_TOTAL,
        "outcome" => outcome.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

pub fn security_block(scanner: &str, severity: &str) {
    metrics::counter!(
        SECURITY_BLOCKS_TOTAL,
        "scanner" => scanner.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

pub fn rollback(resource_kind: &ResourceKind, namespace: &str, reason: &str) {
    metrics::counter!(
        ROLLBACKS_TOTAL,
        "resource_kind" => resource_kind.to_string(),
        "namespace" => namespace.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn analysis_duration(stage: &str, seconds: f64) {
    metrics::histogram!(INCIDENT_ANALYSIS_DURATION_SECONDS, "stage" => stage.to_string())
        .record(seconds);
}
