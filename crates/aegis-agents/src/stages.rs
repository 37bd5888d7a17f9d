//! The three analysis stages: root cause, fix proposal, verification plan

use crate::guardrails;
use crate::prompts;
use crate::state::Transition;
use aegis_common::{
    FaultContext, FixKind, FixProposal, PipelineStage, PipelineState, RcaResult, Severity,
    VerificationPlan,
};
use aegis_llm::StructuredClient;
use std::collections::HashSet;
use tracing::{info, warn};

/// Confidence floor below which the pipeline refuses to guess downstream.
pub const MIN_RCA_CONFIDENCE: f64 = 0.7;

pub(crate) const LOW_CONFIDENCE_ERROR: &str = "low-confidence RCA";

/// Root-cause analysis stage
pub struct RcaStage {
    llm: StructuredClient,
}

impl RcaStage {
    pub fn new(llm: StructuredClient) -> Self {
        Self { llm }
    }

    pub async fn run(&self, state: &mut PipelineState) -> Transition {
        let Some(context) = state.fault_context.clone() else {
            return Transition::abort("no fault context collected");
        };

        match self
            .llm
            .complete_structured::<RcaResult>(&prompts::rca_request(&context))
            .await
        {
            Ok(mut rca) => {
                rca.confidence = rca.confidence.clamp(0.0, 1.0);
                guardrails::ensure_rca_verbosity(&mut rca, &context);
                info!(
                    incident_id = %state.incident_id,
                    correlation_key = %state.correlation_key,
                    severity = %rca.severity,
                    confidence = rca.confidence,
                    "root cause identified"
                );
                state.push_message(
                    PipelineStage::Rca,
                    format!(
                        "root cause: {} (confidence {:.2})",
                        rca.root_cause, rca.confidence
                    ),
                );
                let confident = rca.confidence >= MIN_RCA_CONFIDENCE;
                state.rca_result = Some(rca);
                if confident {
                    Transition::Next(PipelineStage::Fix)
                } else {
                    Transition::abort(LOW_CONFIDENCE_ERROR)
                }
            }
            Err(e) => {
                warn!(
                    incident_id = %state.incident_id,
                    correlation_key = %state.correlation_key,
                    error = %e,
                    "RCA stage failed, recording minimal result"
                );
                let mut rca = fallback_rca(&context);
                guardrails::ensure_rca_verbosity(&mut rca, &context);
                state.push_message(PipelineStage::Rca, format!("analysis failed: {}", e));
                state.rca_result = Some(rca);
                Transition::abort(format!("RCA analysis failed: {}", e))
            }
        }
    }
}

fn fallback_rca(context: &FaultContext) -> RcaResult {
    let evidence: Vec<String> = context.all_errors().iter().map(|s| s.to_string()).collect();
    RcaResult {
        root_cause: "undetermined; analysis backend produced no usable result".to_string(),
        contributing_factors: evidence.clone(),
        severity: Severity::Medium,
        confidence: 0.0,
        reasoning: String::new(),
        affected_components: vec![context.resource.to_string()],
        analysis_steps: Vec::new(),
        evidence_summary: evidence,
        decision_rationale: String::new(),
    }
}

/// Fix proposal stage
pub struct FixStage {
    llm: StructuredClient,
    production_namespaces: HashSet<String>,
}

impl FixStage {
    pub fn new(llm: StructuredClient, production_namespaces: HashSet<String>) -> Self {
        Self {
            llm,
            production_namespaces,
        }
    }

    fn is_production(&self, namespace: &str) -> bool {
        self.production_namespaces.contains(namespace)
    }

    pub async fn run(&self, state: &mut PipelineState) -> Transition {
        let (Some(context), Some(rca)) = (state.fault_context.clone(), state.rca_result.clone())
        else {
            return Transition::abort("fix stage reached without RCA result");
        };

        match self
            .llm
            .complete_structured::<FixProposal>(&prompts::fix_request(&rca, &context))
            .await
        {
            Ok(mut fix) => {
                if !fix.is_actionable() && fix.kind != FixKind::Manual {
                    warn!(
                        incident_id = %state.incident_id,
                        "proposal has no commands or manifests, downgrading to manual"
                    );
                    fix.kind = FixKind::Manual;
                }
                guardrails::ensure_fix_verbosity(&mut fix, &context);
                state.push_message(
                    PipelineStage::Fix,
                    format!("proposed {} fix: {}", fix.kind, fix.description),
                );

                let needs_verification = rca.severity.requires_verification()
                    || self.is_production(&state.resource.namespace)
                    || !fix.risks.is_empty();
                state.fix_proposal = Some(fix);
                if needs_verification {
                    Transition::Next(PipelineStage::Verify)
                } else {
                    Transition::Finish
                }
            }
            Err(e) => {
                warn!(
                    incident_id = %state.incident_id,
                    error = %e,
                    "fix stage failed, recording manual proposal"
                );
                let mut fix = FixProposal::manual(format!(
                    "automated remediation unavailable for {}; operator attention required",
                    state.resource
                ));
                guardrails::ensure_fix_verbosity(&mut fix, &context);
                state.push_message(PipelineStage::Fix, format!("proposal failed: {}", e));
                state.fix_proposal = Some(fix);
                Transition::abort(format!("fix proposal failed: {}", e))
            }
        }
    }
}

/// Verification planning stage
pub struct VerifyStage {
    llm: StructuredClient,
    production_namespaces: HashSet<String>,
}

impl VerifyStage {
    pub fn new(llm: StructuredClient, production_namespaces: HashSet<String>) -> Self {
        Self {
            llm,
            production_namespaces,
        }
    }

    pub async fn run(&self, state: &mut PipelineState) -> Transition {
        let (Some(context), Some(fix)) = (state.fault_context.clone(), state.fix_proposal.clone())
        else {
            return Transition::abort("verify stage reached without fix proposal");
        };

        match self
            .llm
            .complete_structured::<VerificationPlan>(&prompts::verify_request(&fix, &context))
            .await
        {
            Ok(mut plan) => {
                self.enforce_plan_rules(&mut plan, &fix, state);
                guardrails::ensure_plan_verbosity(&mut plan, &fix);
                state.push_message(
                    PipelineStage::Verify,
                    format!(
                        "verification planned: {} for {}s, approval_required={}",
                        plan.verification_type, plan.duration_seconds, plan.approval_required
                    ),
                );
                state.verification_plan = Some(plan);
                Transition::Finish
            }
            Err(e) => {
                warn!(
                    incident_id = %state.incident_id,
                    error = %e,
                    "verify stage failed, recording conservative plan"
                );
                let mut plan = conservative_plan(&fix);
                self.enforce_plan_rules(&mut plan, &fix, state);
                guardrails::ensure_plan_verbosity(&mut plan, &fix);
                state.push_message(PipelineStage::Verify, format!("planning failed: {}", e));
                state.verification_plan = Some(plan);
                Transition::abort(format!("verification planning failed: {}", e))
            }
        }
    }

    /// Invariants the plan must satisfy regardless of what the model said.
    fn enforce_plan_rules(
        &self,
        plan: &mut VerificationPlan,
        fix: &FixProposal,
        state: &PipelineState,
    ) {
        if self.production_namespaces.contains(&state.resource.namespace) || !fix.risks.is_empty()
        {
            plan.approval_required = true;
        }
        let image_check = "image-scan".to_string();
        if fix.kind == FixKind::Patch
            && fix.proposed_image().is_some()
            && !plan.security_checks.contains(&image_check)
        {
            plan.security_checks.push(image_check);
        }
        if plan.duration_seconds < 30 {
            plan.duration_seconds = 30;
        }
    }
}

fn conservative_plan(fix: &FixProposal) -> VerificationPlan {
    VerificationPlan {
        verification_type: "health-monitoring".to_string(),
        test_scenarios: vec![format!("exercise the {} fix in a shadow clone", fix.kind)],
        success_criteria: vec!["health score at or above 0.8".to_string()],
        duration_seconds: 120,
        load_test_config: None,
        security_checks: vec!["runtime-alerts".to_string()],
        rollback_on_failure: true,
        approval_required: true,
        analysis_steps: Vec::new(),
        decision_rationale: String::new(),
    }
}
