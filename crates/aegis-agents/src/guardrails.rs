//! Verbosity guardrails for analysis results
//!
//! Downstream consumers (approval rendering, report artefacts) rely on the
//! trace fields being populated. When the model leaves them empty they are
//! synthesized from the fault context, best-effort and never failing.

use aegis_common::{FaultContext, FixProposal, RcaResult, VerificationPlan};

fn context_steps(context: &FaultContext) -> Vec<String> {
    let mut steps = Vec::new();
    if !context.findings.is_empty() {
        steps.push(format!(
            "Reviewed {} diagnostic finding(s) for {}",
            context.findings.len(),
            context.resource
        ));
    }
    if !context.log_tail.is_empty() {
        steps.push(format!("Inspected {} recent log lines", context.log_tail.len()));
    }
    if !context.events.is_empty() {
        steps.push(format!("Inspected {} recent cluster events", context.events.len()));
    }
    if context.manifest.is_some() {
        steps.push("Compared the live manifest against expected state".to_string());
    }
    if steps.is_empty() {
        steps.push(format!(
            "Analyzed available signals for {} (context was partial)",
            context.resource
        ));
    }
    steps
}

fn context_evidence(context: &FaultContext) -> Vec<String> {
    let mut evidence: Vec<String> = context
        .findings
        .iter()
        .flat_map(|f| f.errors.iter().cloned())
        .collect();
    evidence.extend(context.errors.iter().cloned());
    if evidence.is_empty() {
        evidence.push("No explicit error strings in the collected context".to_string());
    }
    evidence
}

/// Fill empty trace fields on an RCA result from the fault context.
pub fn ensure_rca_verbosity(rca: &mut RcaResult, context: &FaultContext) {
    if rca.analysis_steps.is_empty() {
        rca.analysis_steps = context_steps(context);
    }
    if rca.evidence_summary.is_empty() {
        rca.evidence_summary = context_evidence(context);
    }
    if rca.decision_rationale.is_empty() {
        rca.decision_rationale = format!(
            "Root cause '{}' selected at {:.2} confidence from the collected evidence",
            rca.root_cause, rca.confidence
        );
    }
}

/// Fill empty trace fields on a fix proposal.
pub fn ensure_fix_verbosity(fix: &mut FixProposal, context: &FaultContext) {
    if fix.analysis_steps.is_empty() {
        let mut steps = context_steps(context);
        steps.push(format!("Selected a {} remediation", fix.kind));
        fix.analysis_steps = steps;
    }
    if fix.decision_rationale.is_empty() {
        fix.decision_rationale = format!(
            "{} chosen as the smallest change addressing the diagnosed fault",
            fix.kind
        );
    }
}

/// Fill empty trace fields on a verification plan.
pub fn ensure_plan_verbosity(plan: &mut VerificationPlan, fix: &FixProposal) {
    if plan.analysis_steps.is_empty() {
        plan.analysis_steps = vec![format!(
            "Planned {} verification for the proposed {} fix",
            plan.verification_type, fix.kind
        )];
    }
    if plan.decision_rationale.is_empty() {
        plan.decision_rationale = format!(
            "Verification scoped to {} seconds with {} security check(s)",
            plan.duration_seconds,
            plan.security_checks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::{DiagnosticFinding, ResourceKind, ResourceRef, Severity};

    fn context() -> FaultContext {
        let mut context =
            FaultContext::empty(ResourceRef::new("default", ResourceKind::Pod, "web"));
        context.findings.push(DiagnosticFinding {
            kind: "Pod".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            errors: vec!["CrashLoopBackOff".to_string()],
            parent: None,
        });
        context
    }

    #[test]
    fn empty_rca_fields_are_synthesized() {
        let mut rca = RcaResult {
            root_cause: "bad liveness probe".to_string(),
            contributing_factors: vec![],
            severity: Severity::High,
            confidence: 0.9,
            reasoning: String::new(),
            affected_components: vec![],
            analysis_steps: vec![],
            evidence_summary: vec![],
            decision_rationale: String::new(),
        };
        ensure_rca_verbosity(&mut rca, &context());
        assert!(!rca.analysis_steps.is_empty());
        assert!(!rca.evidence_summary.is_empty());
        assert!(!rca.decision_rationale.is_empty());
        assert!(rca.evidence_summary[0].contains("CrashLoopBackOff"));
    }

    #[test]
    fn populated_fields_are_left_alone() {
        let mut rca = RcaResult {
            root_cause: "oom".to_string(),
            contributing_factors: vec![],
            severity: Severity::High,
            confidence: 0.8,
            reasoning: String::new(),
            affected_components: vec![],
            analysis_steps: vec!["model step".to_string()],
            evidence_summary: vec!["model evidence".to_string()],
            decision_rationale: "model rationale".to_string(),
        };
        ensure_rca_verbosity(&mut rca, &context());
        assert_eq!(rca.analysis_steps, vec!["model step"]);
        assert_eq!(rca.decision_rationale, "model rationale");
    }

    #[test]
    fn guardrail_works_on_empty_context() {
        let mut fix = FixProposal::manual("operator attention required");
        let empty = FaultContext::empty(ResourceRef::new("default", ResourceKind::Pod, "web"));
        ensure_fix_verbosity(&mut fix, &empty);
        assert!(!fix.analysis_steps.is_empty());
        assert!(!fix.decision_rationale.is_empty());
    }
}
