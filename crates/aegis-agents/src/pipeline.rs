//! Pipeline driver: diagnostics, then RCA → Fix → Verify

use crate::stages::{FixStage, RcaStage, VerifyStage};
use crate::state::Transition;
use aegis_cluster::DiagnosticCollector;
use aegis_common::{metrics, Config, Incident, PipelineStage, PipelineState};
use aegis_llm::{LlmBackend, StructuredClient};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Three cooperating analysis stages sharing one state per incident.
///
/// Each incident gets its own `PipelineState`; pipelines for distinct
/// correlation keys run in parallel and never share state.
pub struct AgentPipeline {
    collector: Arc<DiagnosticCollector>,
    rca: RcaStage,
    fix: FixStage,
    verify: VerifyStage,
}

impl AgentPipeline {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        collector: Arc<DiagnosticCollector>,
        config: &Config,
    ) -> Self {
        let production: HashSet<String> = config
            .queue
            .production_namespaces
            .iter()
            .cloned()
            .collect();
        let retries = config.llm.max_retries;
        Self {
            collector,
            rca: RcaStage::new(StructuredClient::new(backend.clone(), retries)),
            fix: FixStage::new(
                StructuredClient::new(backend.clone(), retries),
                production.clone(),
            ),
            verify: VerifyStage::new(StructuredClient::new(backend, retries), production),
        }
    }

    /// Run the analysis for one incident to completion or abort.
    pub async fn run(&self, incident: &Incident, cancel: &CancellationToken) -> PipelineState {
        let mut state = PipelineState::new(incident);
        info!(
            incident_id = %incident.id,
            correlation_key = %incident.correlation_key,
            resource = %incident.resource,
            "starting analysis pipeline"
        );

        let context = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                state.error = Some("cancelled during diagnostics".to_string());
                return state;
            }
            context = self.collector.collect(&incident.resource) => context,
        };
        state.fault_context = Some(context);

        loop {
            let stage = state.current_stage;
            let start = Instant::now();
            let transition = tokio::select! {
                biased;
                _ = cancel.cancelled() => Transition::abort("cancelled"),
                transition = self.run_stage(stage, &mut state) => transition,
            };
            metrics::analysis_duration(stage.as_str(), start.elapsed().as_secs_f64());
            debug!(
                incident_id = %incident.id,
                stage = %stage,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "stage finished"
            );

            match transition {
                Transition::Next(next) => state.current_stage = next,
                Transition::Finish => break,
                Transition::Abort(reason) => {
                    if state.error.is_none() {
                        state.error = Some(reason);
                    }
                    break;
                }
            }
        }

        state
    }

    async fn run_stage(&self, stage: PipelineStage, state: &mut PipelineState) -> Transition {
        match stage {
            PipelineStage::Rca => self.rca.run(state).await,
            PipelineStage::Fix => self.fix.run(state).await,
            PipelineStage::Verify => self.verify.run(state).await,
            // Shadow and apply belong to the operator, not the analysis DAG.
            PipelineStage::Shadow | PipelineStage::Apply => Transition::Finish,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cluster::{MockCluster, PodFixture};
    use aegis_common::config::ClusterConfig;
    use aegis_common::{FixKind, Priority, ResourceKind, ResourceRef, Severity, TriggerSignal};
    use aegis_llm::testing::ScriptedBackend;
    use serde_json::json;

    fn oom_incident() -> Incident {
        Incident::new(
            ResourceRef::new("production", ResourceKind::Pod, "demo-api-7fbd"),
            Priority::P1,
            Severity::High,
            TriggerSignal::OomKill,
        )
    }

    fn pipeline_with(backend: Arc<ScriptedBackend>) -> AgentPipeline {
        let cluster = Arc::new(MockCluster::new());
        let mut fixture = PodFixture::running("demo-api-7fbd");
        fixture.ready = false;
        fixture.oom_killed = true;
        cluster.add_pod("production", fixture);
        cluster.push_logs("production", &["Container OOMKilled", "restarting"]);

        let cluster_config = ClusterConfig {
            diagnostic_mock: true,
            ..Default::default()
        };
        let collector = Arc::new(DiagnosticCollector::new(
            cluster,
            &cluster_config,
            "test-model",
        ));
        AgentPipeline::new(backend, collector, &Config::default())
    }

    fn rca_json(severity: &str, confidence: f64) -> serde_json::Value {
        json!({
            "root_cause": "memory limit below working set",
            "contributing_factors": ["traffic growth"],
            "severity": severity,
            "confidence": confidence,
            "reasoning": "repeated OOM kills at identical RSS",
            "affected_components": ["production/Pod/demo-api-7fbd"],
            "analysis_steps": [],
            "evidence_summary": [],
            "decision_rationale": ""
        })
    }

    fn patch_fix_json() -> serde_json::Value {
        json!({
            "kind": "patch",
            "description": "raise the container memory limit",
            "commands": [],
            "manifests": {
                "patch.yaml": "spec:\n  template:\n    spec:\n      containers:\n        - name: api\n          image: demo-api:1.2.3-hotfix\n          resources:\n            limits:\n              memory: 1Gi\n"
            },
            "rollback_commands": ["kubectl rollout undo deployment/demo-api -n production"],
            "estimated_downtime": "none",
            "risks": ["higher node memory pressure"],
            "prerequisites": [],
            "confidence": 0.88
        })
    }

    #[tokio::test]
    async fn full_flow_reaches_verification_plan() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_ok(rca_json("critical", 0.9));
        backend.push_ok(patch_fix_json());
        backend.push_ok(json!({
            "verification_type": "health-monitoring",
            "test_scenarios": ["replay production traffic shape"],
            "success_criteria": ["health score >= 0.8"],
            "duration_seconds": 120,
            "security_checks": [],
            "rollback_on_failure": true,
            "approval_required": false
        }));

        let pipeline = pipeline_with(backend.clone());
        let cancel = CancellationToken::new();
        let state = pipeline.run(&oom_incident(), &cancel).await;

        assert!(state.error.is_none(), "unexpected error: {:?}", state.error);
        let rca = state.rca_result.as_ref().unwrap();
        assert!(rca.confidence >= 0.8);
        assert!(!rca.analysis_steps.is_empty());
        assert!(!rca.decision_rationale.is_empty());

        let fix = state.fix_proposal.as_ref().unwrap();
        assert_eq!(fix.kind, FixKind::Patch);
        assert!(fix.manifests.values().any(|m| m.contains("memory: 1Gi")));

        let plan = state.verification_plan.as_ref().unwrap();
        assert!(plan.approval_required, "production namespace forces approval");
        assert!(plan.security_checks.contains(&"image-scan".to_string()));
        assert!(!state.messages().is_empty());
        assert_eq!(backend.remaining(), 0);
    }

    #[tokio::test]
    async fn low_confidence_rca_stops_the_pipeline() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_ok(rca_json("medium", 0.4));

        let pipeline = pipeline_with(backend);
        let state = pipeline.run(&oom_incident(), &CancellationToken::new()).await;

        assert_eq!(state.error.as_deref(), Some("low-confidence RCA"));
        assert!(state.rca_result.is_some());
        assert!(state.fix_proposal.is_none());
        assert!(state.verification_plan.is_none());
    }

    #[tokio::test]
    async fn repeated_malformed_output_degrades_to_minimal_result() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_malformed("not json");
        backend.push_malformed("still not json");

        let pipeline = pipeline_with(backend);
        let state = pipeline.run(&oom_incident(), &CancellationToken::new()).await;

        assert!(state.error.as_deref().unwrap().contains("RCA analysis failed"));
        let rca = state.rca_result.as_ref().unwrap();
        assert_eq!(rca.confidence, 0.0);
        assert!(!rca.analysis_steps.is_empty());
        assert!(!rca.decision_rationale.is_empty());
    }

    #[tokio::test]
    async fn safe_fix_outside_production_skips_verification() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_ok(rca_json("medium", 0.85));
        backend.push_ok(json!({
            "kind": "restart",
            "description": "restart the workload",
            "commands": ["kubectl rollout restart deployment/web -n staging"],
            "risks": [],
            "confidence": 0.9
        }));

        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod("staging", PodFixture::running("web-0"));
        let collector = Arc::new(DiagnosticCollector::new(
            cluster,
            &ClusterConfig {
                diagnostic_mock: true,
                ..Default::default()
            },
            "test-model",
        ));
        let pipeline = AgentPipeline::new(backend, collector, &Config::default());

        let incident = Incident::new(
            ResourceRef::new("staging", ResourceKind::Deployment, "web"),
            Priority::P2,
            Severity::Medium,
            TriggerSignal::ReplicaShortfall {
                ready: 1,
                desired: 3,
            },
        );
        let state = pipeline.run(&incident, &CancellationToken::new()).await;

        assert!(state.error.is_none());
        assert!(state.fix_proposal.is_some());
        assert!(state.verification_plan.is_none());
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let backend = Arc::new(ScriptedBackend::new());
        let pipeline = pipeline_with(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = pipeline.run(&oom_incident(), &cancel).await;
        assert!(state
            .error
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        assert!(state.rca_result.is_none());
    }
}
