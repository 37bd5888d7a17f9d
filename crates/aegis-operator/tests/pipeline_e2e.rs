//! End-to-end incident flow over the mock cluster
//!
//! Exercises the full chain (queue → pipeline → shadow → security gate →
//! approval → apply → rollback watch) with a scripted analysis backend and
//! scripted scanners standing in for the external tools.

mod support;

use aegis_agents::AgentPipeline;
use aegis_cluster::{ClusterOps, DiagnosticCollector, MockCluster, PodFixture};
use aegis_common::{
    Config, FixKind, Incident, IncidentStatus, Priority, ResourceKind, ResourceRef, Severity,
    TriggerSignal,
};
use aegis_llm::testing::ScriptedBackend;
use aegis_operator::{
    ApprovalDecision, Approver, FixExecutor, IncidentProcessor, RollbackOutcome, RollbackWatcher,
    StaticApprover,
};
use aegis_queue::IncidentQueue;
use aegis_security::{ScanContext, Scanner, SecurityPipeline};
use aegis_shadow::ShadowManager;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{metric_delta, recorder, BlockingImageScanner, PassingImageScanner};
use tokio_util::sync::CancellationToken;

struct Harness {
    cluster: Arc<MockCluster>,
    queue: Arc<IncidentQueue>,
    backend: Arc<ScriptedBackend>,
    processor: IncidentProcessor,
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.cluster.diagnostic_mock = true;
    config.shadow.readiness_timeout_seconds = 2;
    config.shadow.cleanup_timeout_seconds = 2;
    config.rollback.rollback_window_seconds = 10;
    config.rollback.poll_interval_seconds = 1;
    config
}

fn harness_with(
    config: Config,
    scanners: Vec<Arc<dyn Scanner>>,
    approver: Arc<dyn Approver>,
) -> Harness {
    let cluster = Arc::new(MockCluster::new());
    cluster.add_deployment("production", "demo-api", "demo-api:1.2.2", 3);
    let mut crashing = PodFixture::running("demo-api-7fbd");
    crashing.ready = false;
    crashing.restart_count = 6;
    crashing.oom_killed = true;
    crashing.waiting_reason = Some("CrashLoopBackOff".to_string());
    cluster.add_pod("production", crashing);
    cluster.push_logs("production", &["serving", "ERROR oom kill", "serving", "serving"]);

    let config = Arc::new(config);
    let backend = Arc::new(ScriptedBackend::new());
    let collector = Arc::new(DiagnosticCollector::new(
        cluster.clone(),
        &config.cluster,
        "test-model",
    ));
    let pipeline = Arc::new(AgentPipeline::new(
        backend.clone(),
        collector,
        &config,
    ));
    let queue = Arc::new(IncidentQueue::new(&config.queue));
    let shadow = Arc::new(
        ShadowManager::new(
            cluster.clone(),
            Arc::new(SecurityPipeline::new(scanners)),
            config.shadow.clone(),
        )
        .with_poll_interval(Duration::from_millis(500)),
    );
    let executor = Arc::new(FixExecutor::new(cluster.clone()));
    let rollback = Arc::new(RollbackWatcher::new(
        cluster.clone(),
        executor.clone(),
        config.rollback.clone(),
    ));
    let processor = IncidentProcessor::new(
        queue.clone(),
        pipeline,
        shadow,
        executor,
        rollback,
        approver,
        config.clone(),
    )
    .with_retry_delays(vec![
        Duration::from_millis(100),
        Duration::from_millis(200),
    ]);

    Harness {
        cluster,
        queue,
        backend,
        processor,
    }
}

fn oom_incident() -> Incident {
    Incident::new(
        ResourceRef::new("production", ResourceKind::Pod, "demo-api-7fbd"),
        Priority::P1,
        Severity::High,
        TriggerSignal::OomKill,
    )
}

fn script_strong_rca(backend: &ScriptedBackend) {
    backend.push_ok(json!({
        "root_cause": "container memory limit below observed working set",
        "contributing_factors": ["sustained traffic growth"],
        "severity": "critical",
        "confidence": 0.9,
        "reasoning": "repeated OOM kills at identical RSS ceiling",
        "affected_components": ["production/Pod/demo-api-7fbd"]
    }));
}

fn script_patch_fix(backend: &ScriptedBackend) {
    backend.push_ok(json!({
        "kind": "patch",
        "description": "raise the memory limit and roll the hotfix image",
        "manifests": {
            "patch.yaml": "spec:\n  template:\n    spec:\n      containers:\n        - name: demo-api\n          image: demo-api:1.2.3-hotfix\n          resources:\n            limits:\n              memory: 1Gi\n"
        },
        "rollback_commands": ["kubectl rollout undo deployment/demo-api -n production"],
        "estimated_downtime": "none",
        "risks": ["increased node memory pressure"],
        "confidence": 0.88
    }));
}

fn script_verification_plan(backend: &ScriptedBackend) {
    backend.push_ok(json!({
        "verification_type": "health-monitoring",
        "test_scenarios": ["run the patched workload under the shadow quota"],
        "success_criteria": ["health score at or above 0.8"],
        "duration_seconds": 30,
        "security_checks": ["image-scan"],
        "rollback_on_failure": true,
        "approval_required": true
    }));
}

#[tokio::test(start_paused = true)]
async fn oom_crashloop_flows_to_applied_fix() {
    recorder();
    let harness = harness_with(
        fast_config(),
        vec![Arc::new(PassingImageScanner)],
        Arc::new(StaticApprover::approving()),
    );
    script_strong_rca(&harness.backend);
    script_patch_fix(&harness.backend);
    script_verification_plan(&harness.backend);

    let outcome = harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, IncidentStatus::Resolved);
    let state = &outcome.state;

    let rca = state.rca_result.as_ref().unwrap();
    assert!(rca.confidence >= 0.8);
    let fix = state.fix_proposal.as_ref().unwrap();
    assert_eq!(fix.kind, FixKind::Patch);
    assert!(fix
        .manifests
        .values()
        .any(|m| m.contains("memory: 1Gi")));
    let plan = state.verification_plan.as_ref().unwrap();
    assert!(plan.approval_required);
    assert!(plan.security_checks.contains(&"image-scan".to_string()));

    assert_eq!(state.shadow_passed, Some(true));
    let report = state.security_report.as_ref().unwrap();
    assert!(report.passed);
    assert!(report.outcomes.iter().any(|o| o.tool == "image"));

    // The fix reached the production deployment.
    let manifest = harness
        .cluster
        .deployment_manifest("production", "demo-api")
        .unwrap();
    assert_eq!(
        manifest["spec"]["template"]["spec"]["containers"][0]["image"],
        "demo-api:1.2.3-hotfix"
    );
    // The shadow namespace was torn down.
    assert!(!harness.cluster.deleted_namespaces().is_empty());
    assert_eq!(outcome.rollback, Some(RollbackOutcome::Healthy));
}

#[tokio::test(start_paused = true)]
async fn vulnerable_image_is_blocked_and_cleaned_up() {
    let recorder = recorder();
    let blocks_before = recorder.counter_sum("security_blocks_total", &["scanner=image", "severity=CRITICAL"]);

    let harness = harness_with(
        fast_config(),
        vec![Arc::new(BlockingImageScanner)],
        Arc::new(StaticApprover::approving()),
    );
    script_strong_rca(&harness.backend);
    harness.backend.push_ok(json!({
        "kind": "patch",
        "description": "roll to the candidate image",
        "manifests": {
            "patch.yaml": "spec:\n  template:\n    spec:\n      containers:\n        - name: demo-api\n          image: nginx:1.10\n"
        },
        "risks": ["unvetted image"],
        "confidence": 0.8
    }));
    script_verification_plan(&harness.backend);

    let outcome = harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, IncidentStatus::Rejected);
    assert_eq!(outcome.state.shadow_passed, Some(false));
    let report = outcome.state.security_report.as_ref().unwrap();
    assert!(!report.passed);
    assert!(!report.skipped);

    // Blocked deterministically: no retries, one namespace created and
    // cleaned, production untouched.
    assert_eq!(harness.cluster.deleted_namespaces().len(), 1);
    let manifest = harness
        .cluster
        .deployment_manifest("production", "demo-api")
        .unwrap();
    assert_eq!(
        manifest["spec"]["template"]["spec"]["containers"][0]["image"],
        "demo-api:1.2.2"
    );
    assert_eq!(
        metric_delta(
            blocks_before,
            recorder.counter_sum("security_blocks_total", &["scanner=image", "severity=CRITICAL"])
        ),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn absent_diagnostic_tool_degrades_and_low_confidence_stops() {
    recorder();
    let mut config = fast_config();
    config.cluster.diagnostic_mock = false;
    config.cluster.diagnostic_tool = "aegis-test-missing-diagnostic".to_string();

    let harness = harness_with(config, vec![], Arc::new(StaticApprover::approving()));
    harness.backend.push_ok(json!({
        "root_cause": "insufficient evidence without diagnostics",
        "severity": "medium",
        "confidence": 0.4
    }));

    let outcome = harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, IncidentStatus::Failed);
    assert_eq!(outcome.state.error.as_deref(), Some("low-confidence RCA"));
    let context = outcome.state.fault_context.as_ref().unwrap();
    assert_eq!(context.errors, vec!["diagnostic-unavailable"]);
    // No shadow was created.
    assert!(outcome.state.shadow_env_id.is_none());
    assert!(harness.cluster.deleted_namespaces().is_empty());
}

/// Observes the production lock state at approval time.
struct LockProbe {
    queue: Arc<IncidentQueue>,
    observed: parking_lot::Mutex<Option<bool>>,
}

#[async_trait]
impl Approver for LockProbe {
    async fn request(
        &self,
        _incident: &Incident,
        _state: &aegis_common::PipelineState,
    ) -> ApprovalDecision {
        *self.observed.lock() = Some(self.queue.is_production_locked());
        ApprovalDecision::Approved
    }
}

#[tokio::test(start_paused = true)]
async fn critical_rca_locks_production_for_the_duration() {
    recorder();
    let mut config = fast_config();
    config.rollback.rollback_enabled = false;

    // Build the harness first so the probe can share its queue.
    let Harness {
        queue,
        backend,
        processor,
        ..
    } = harness_with(config, vec![], Arc::new(StaticApprover::approving()));
    let probe = Arc::new(LockProbe {
        queue: queue.clone(),
        observed: parking_lot::Mutex::new(None),
    });
    let processor = processor.with_approver(probe.clone());

    script_strong_rca(&backend);
    script_patch_fix(&backend);
    script_verification_plan(&backend);

    // A lower-priority production incident sits behind the lock.
    let p1 = Incident::new(
        ResourceRef::new("production", ResourceKind::Deployment, "demo-api"),
        Priority::P1,
        Severity::High,
        TriggerSignal::ReplicaShortfall {
            ready: 1,
            desired: 3,
        },
    );
    queue.enqueue(p1).await.unwrap();

    let outcome = processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;
    assert_eq!(outcome.status, IncidentStatus::Resolved);

    // The lock was held while the critical incident was processed and
    // released at finalization.
    assert_eq!(*probe.observed.lock(), Some(true));
    assert!(!queue.is_production_locked());
    let next = queue.dequeue(Duration::from_millis(100)).await;
    assert_eq!(next.unwrap().resource.name, "demo-api");
}

#[tokio::test(start_paused = true)]
async fn post_apply_error_spike_triggers_rollback() {
    let recorder = recorder();
    let rollbacks_before =
        recorder.counter_sum("rollbacks_total", &["reason=error_rate_spike"]);

    let mut config = fast_config();
    config.rollback.rollback_window_seconds = 20;
    let harness = harness_with(config, vec![], Arc::new(StaticApprover::approving()));

    script_strong_rca(&harness.backend);
    script_patch_fix(&harness.backend);
    script_verification_plan(&harness.backend);

    // Degrade the workload shortly after the apply lands: the shadow phase
    // monitors for 30 virtual seconds, so the spike arrives inside the
    // rollback window that starts right after it.
    {
        let cluster = harness.cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            cluster.push_logs(
                "production",
                &[
                    "ERROR upstream timeout",
                    "ERROR upstream timeout",
                    "ERROR upstream timeout",
                    "ERROR upstream timeout",
                    "ERROR upstream timeout",
                    "ERROR upstream timeout",
                ],
            );
        });
    }

    let outcome = harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, IncidentStatus::Failed);
    assert_eq!(
        outcome.rollback,
        Some(RollbackOutcome::RolledBack {
            reason: "error_rate_spike".to_string()
        })
    );
    // The pre-apply image is back.
    let manifest = harness
        .cluster
        .deployment_manifest("production", "demo-api")
        .unwrap();
    assert_eq!(
        manifest["spec"]["template"]["spec"]["containers"][0]["image"],
        "demo-api:1.2.2"
    );
    assert_eq!(
        metric_delta(
            rollbacks_before,
            recorder.counter_sum("rollbacks_total", &["reason=error_rate_spike"])
        ),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_approval_leaves_production_untouched() {
    recorder();
    let harness = harness_with(
        fast_config(),
        vec![],
        Arc::new(StaticApprover::rejecting()),
    );
    script_strong_rca(&harness.backend);
    script_patch_fix(&harness.backend);
    script_verification_plan(&harness.backend);

    let outcome = harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, IncidentStatus::Rejected);
    assert_eq!(outcome.state.shadow_passed, Some(true));
    let manifest = harness
        .cluster
        .deployment_manifest("production", "demo-api")
        .unwrap();
    assert_eq!(
        manifest["spec"]["template"]["spec"]["containers"][0]["image"],
        "demo-api:1.2.2"
    );
}

/// Image scan context resolution: the scanner sees the image carried by the
/// proposal's manifest.
#[tokio::test(start_paused = true)]
async fn image_scanner_receives_the_proposed_image() {
    recorder();

    struct CapturingScanner {
        seen: parking_lot::Mutex<Option<String>>,
    }
    #[async_trait]
    impl Scanner for CapturingScanner {
        fn id(&self) -> &'static str {
            "image"
        }
        fn fail_mode(&self) -> aegis_security::FailMode {
            aegis_security::FailMode::Closed
        }
        fn should_run(&self, context: &ScanContext) -> bool {
            context.image.is_some()
        }
        async fn scan(&self, context: &ScanContext) -> aegis_common::ScanOutcome {
            *self.seen.lock() = context.image.clone();
            aegis_common::ScanOutcome {
                tool: "image".to_string(),
                passed: true,
                skipped: false,
                reason: None,
                findings: vec![],
                summary: "clean".to_string(),
                raw: serde_json::Value::Null,
            }
        }
    }

    let capturing = Arc::new(CapturingScanner {
        seen: parking_lot::Mutex::new(None),
    });
    let harness = harness_with(
        fast_config(),
        vec![capturing.clone()],
        Arc::new(StaticApprover::approving()),
    );
    script_strong_rca(&harness.backend);
    script_patch_fix(&harness.backend);
    script_verification_plan(&harness.backend);

    harness
        .processor
        .process_one(oom_incident(), CancellationToken::new())
        .await;
    assert_eq!(
        capturing.seen.lock().as_deref(),
        Some("demo-api:1.2.3-hotfix")
    );
}
