//! Prompt construction and response schemas for the analysis stages

use aegis_common::{FaultContext, FixProposal, RcaResult};
use aegis_llm::LlmRequest;
use serde_json::{json, Value};

const MAX_LOG_LINES: usize = 25;
const MAX_EVENTS: usize = 15;
const MAX_MANIFEST_CHARS: usize = 4000;

const RCA_SYSTEM: &str = "You are a site-reliability analyst for a Kubernetes cluster. \
Identify the root cause of the reported fault from the diagnostic evidence. \
Respond only with JSON matching the provided schema.";

const FIX_SYSTEM: &str = "You are a site-reliability engineer proposing a remediation for a \
diagnosed Kubernetes fault. Prefer the smallest safe change. Respond only with JSON \
matching the provided schema.";

const VERIFY_SYSTEM: &str = "You are a release-verification planner. Produce a verification \
plan that exercises the proposed fix in an isolated clone before production rollout. \
Respond only with JSON matching the provided schema.";

fn render_context(context: &FaultContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("Resource: {}\n", context.resource));

    if !context.findings.is_empty() {
        out.push_str("\nDiagnostic findings:\n");
        for finding in &context.findings {
            out.push_str(&format!(
                "- {} {}/{}: {}\n",
                finding.kind,
                finding.namespace,
                finding.name,
                finding.errors.join("; ")
            ));
        }
    }
    if !context.errors.is_empty() {
        out.push_str(&format!(
            "\nCollection warnings: {}\n",
            context.errors.join(", ")
        ));
    }
    if !context.log_tail.is_empty() {
        out.push_str("\nRecent logs:\n");
        for line in context.log_tail.iter().rev().take(MAX_LOG_LINES).rev() {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !context.events.is_empty() {
        out.push_str("\nRecent events:\n");
        for event in context.events.iter().rev().take(MAX_EVENTS).rev() {
            out.push_str(event);
            out.push('\n');
        }
    }
    if let Some(manifest) = &context.manifest {
        out.push_str("\nCurrent manifest:\n");
        if manifest.len() > MAX_MANIFEST_CHARS {
            out.push_str(&manifest[..MAX_MANIFEST_CHARS]);
            out.push_str("\n# (truncated)\n");
        } else {
            out.push_str(manifest);
        }
    }
    out
}

pub fn rca_request(context: &FaultContext) -> LlmRequest {
    let prompt = format!(
        "Analyze the following fault and determine its root cause.\n\n{}",
        render_context(context)
    );
    LlmRequest::new(RCA_SYSTEM, prompt, rca_schema())
}

pub fn fix_request(rca: &RcaResult, context: &FaultContext) -> LlmRequest {
    let prompt = format!(
        "Root cause: {}\nSeverity: {}\nContributing factors: {}\n\n\
         Propose a remediation for this fault. Include rollback commands and \
         any manifests to apply.\n\n{}",
        rca.root_cause,
        rca.severity,
        rca.contributing_factors.join("; "),
        render_context(context)
    );
    LlmRequest::new(FIX_SYSTEM, prompt, fix_schema())
}

pub fn verify_request(fix: &FixProposal, context: &FaultContext) -> LlmRequest {
    let prompt = format!(
        "Proposed fix ({}): {}\nRisks: {}\nCommands: {}\nManifests: {}\n\n\
         Plan the verification of this fix in a shadow clone of the workload, \
         including the security checks that must run.\n\nResource: {}",
        fix.kind,
        fix.description,
        fix.risks.join("; "),
        fix.commands.join(" && "),
        fix.manifests.keys().cloned().collect::<Vec<_>>().join(", "),
        context.resource,
    );
    LlmRequest::new(VERIFY_SYSTEM, prompt, verify_schema())
}

pub fn rca_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "root_cause": {"type": "string"},
            "contributing_factors": {"type": "array", "items": {"type": "string"}},
            "severity": {"type": "string", "enum": ["critical", "high", "medium", "low", "info"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "reasoning": {"type": "string"},
            "affected_components": {"type": "array", "items": {"type": "string"}},
            "analysis_steps": {"type": "array", "items": {"type": "string"}},
            "evidence_summary": {"type": "array", "items": {"type": "string"}},
            "decision_rationale": {"type": "string"}
        },
        "required": ["root_cause", "severity", "confidence"]
    })
}

pub fn fix_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "kind": {
                "type": "string",
                "enum": ["config-change", "restart", "scale", "rollback", "patch", "manual"]
            },
            "description": {"type": "string"},
            "commands": {"type": "array", "items": {"type": "string"}},
            "manifests": {"type": "object", "additionalProperties": {"type": "string"}},
            "rollback_commands": {"type": "array", "items": {"type": "string"}},
            "estimated_downtime": {"type": "string"},
            "risks": {"type": "array", "items": {"type": "string"}},
            "prerequisites": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "analysis_steps": {"type": "array", "items": {"type": "string"}},
            "decision_rationale": {"type": "string"}
        },
        "required": ["kind", "description"]
    })
}

pub fn verify_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verification_type": {"type": "string"},
            "test_scenarios": {"type": "array", "items": {"type": "string"}},
            "success_criteria": {"type": "array", "items": {"type": "string"}},
            "duration_seconds": {"type": "integer", "minimum": 30},
            "load_test_config": {
                "type": "object",
                "properties": {
                    "target_url": {"type": "string"},
                    "requests_per_second": {"type": "integer"},
                    "duration_seconds": {"type": "integer"}
                }
            },
            "security_checks": {"type": "array", "items": {"type": "string"}},
            "rollback_on_failure": {"type": "boolean"},
            "approval_required": {"type": "boolean"},
            "analysis_steps": {"type": "array", "items": {"type": "string"}},
            "decision_rationale": {"type": "string"}
        },
        "required": ["verification_type", "duration_seconds"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::{DiagnosticFinding, ResourceKind, ResourceRef};

    #[test]
    fn context_rendering_includes_findings_and_logs() {
        let mut context = FaultContext::empty(ResourceRef::new(
            "production",
            ResourceKind::Pod,
            "demo-api-7fbd",
        ));
        context.findings.push(DiagnosticFinding {
            kind: "Pod".to_string(),
            name: "demo-api-7fbd".to_string(),
            namespace: "production".to_string(),
            errors: vec!["Container OOMKilled".to_string()],
            parent: None,
        });
        context.log_tail.push("killed process".to_string());

        let request = rca_request(&context);
        assert!(request.prompt.contains("Container OOMKilled"));
        assert!(request.prompt.contains("killed process"));
        assert!(request.schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "confidence"));
    }

    #[test]
    fn log_tail_is_bounded() {
        let mut context =
            FaultContext::empty(ResourceRef::new("default", ResourceKind::Pod, "web"));
        for i in 0..100 {
            context.log_tail.push(format!("line-{}", i));
        }
        let request = rca_request(&context);
        assert!(!request.prompt.contains("line-10\n"));
        assert!(request.prompt.contains("line-99"));
    }
}
