//! Incident processor daemon
//!
//! Drains the queue, runs the analysis pipeline, drives shadow verification
//! with retries, gates the apply on approval, and watches for post-apply
//! regressions. Distinct incidents process concurrently up to the worker
//! bound; the production lock suspends production-namespace work while a
//! critical incident is in flight.

use crate::approval::{approval_required, ApprovalDecision, Approver};
use crate::executor::FixExecutor;
use crate::rollback::{RollbackOutcome, RollbackWatcher};
use aegis_agents::AgentPipeline;
use aegis_common::{
    metrics, Config, FixProposal, Incident, IncidentStatus, PipelineStage, PipelineState, Result,
    Severity, ShadowStatus, VerificationPlan,
};
use aegis_queue::IncidentQueue;
use aegis_shadow::{ChangeSet, ShadowManager};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_SHADOW_ATTEMPTS: usize = 3;
const LOCKED_BACKOFF: Duration = Duration::from_secs(10);

/// Result of processing one incident end to end
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: IncidentStatus,
    pub state: PipelineState,
    pub rollback: Option<RollbackOutcome>,
}

pub struct IncidentProcessor {
    queue: Arc<IncidentQueue>,
    pipeline: Arc<AgentPipeline>,
    shadow: Arc<ShadowManager>,
    executor: Arc<FixExecutor>,
    rollback: Arc<RollbackWatcher>,
    approver: Arc<dyn Approver>,
    config: Arc<Config>,
    retry_delays: Vec<Duration>,
}

impl IncidentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<IncidentQueue>,
        pipeline: Arc<AgentPipeline>,
        shadow: Arc<ShadowManager>,
        executor: Arc<FixExecutor>,
        rollback: Arc<RollbackWatcher>,
        approver: Arc<dyn Approver>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            shadow,
            executor,
            rollback,
            approver,
            config,
            retry_delays: aegis_common::SHADOW_RETRY_DELAYS.to_vec(),
        }
    }

    /// Override the shadow retry schedule (tests).
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Swap the approver (tests).
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    /// The daemon loop: dequeue, honor the production lock, dispatch to
    /// workers, until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let workers = Arc::new(Semaphore::new(self.config.operator.workers.max(1)));
        let dequeue_timeout = Duration::from_secs(self.config.operator.dequeue_timeout_seconds);
        info!(workers = self.config.operator.workers, "incident processor started");

        loop {
            let incident = tokio::select! {
                _ = cancel.cancelled() => break,
                incident = self.queue.dequeue(dequeue_timeout) => incident,
            };
            let Some(incident) = incident else {
                continue;
            };

            if self.queue.is_production_locked()
                && self
                    .config
                    .is_production_namespace(&incident.resource.namespace)
            {
                debug!(incident_id = %incident.id, "production locked, requeueing");
                self.queue.nack(incident.id).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(LOCKED_BACKOFF) => {}
                }
                continue;
            }

            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let processor = self.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                let id = incident.id;
                let outcome = processor.process_one(incident, child).await;
                debug!(incident_id = %id, status = ?outcome.status, "incident finished");
            });
        }
        info!("incident processor stopped");
    }

    /// Process one claimed incident to a terminal state.
    pub async fn process_one(
        &self,
        mut incident: Incident,
        cancel: CancellationToken,
    ) -> ProcessOutcome {
        incident.status = IncidentStatus::Analyzing;
        let mut state = self.pipeline.run(&incident, &cancel).await;

        let mut locked_here = false;
        if let Some(rca) = &state.rca_result {
            if rca.severity == Severity::Critical && !self.queue.is_production_locked() {
                self.queue.lock_production();
                locked_here = true;
            }
        }

        let (status, rollback) = self.drive_remediation(&mut incident, &mut state, &cancel).await;

        incident.status = status;
        self.queue.acknowledge(incident.id).await;
        if locked_here {
            self.queue.unlock_production();
        }
        info!(
            incident_id = %incident.id,
            correlation_key = %incident.correlation_key,
            status = ?status,
            "incident finalized"
        );
        ProcessOutcome {
            status,
            state,
            rollback,
        }
    }

    async fn drive_remediation(
        &self,
        incident: &mut Incident,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> (IncidentStatus, Option<RollbackOutcome>) {
        if let Some(error) = &state.error {
            warn!(
                incident_id = %incident.id,
                correlation_key = %incident.correlation_key,
                error = %error,
                "analysis did not produce an applicable fix"
            );
            return (IncidentStatus::Failed, None);
        }
        let Some(fix) = state.fix_proposal.clone() else {
            return (IncidentStatus::Failed, None);
        };
        if !fix.is_actionable() {
            info!(incident_id = %incident.id, "manual fix proposed, awaiting operator");
            return (IncidentStatus::Rejected, None);
        }

        if let Some(plan) = state.verification_plan.clone() {
            let passed = self
                .verify_in_shadow(incident, state, &fix, &plan, cancel)
                .await;
            if !passed {
                return (IncidentStatus::Rejected, None);
            }
        } else {
            // Safe path: no verification plan was warranted. The apply
            // invariant is satisfied by this explicit bypass.
            state.shadow_passed = None;
            state.push_message(PipelineStage::Shadow, "shadow verification bypassed");
        }

        incident.status = IncidentStatus::AwaitingApproval;
        let is_production = self
            .config
            .is_production_namespace(&incident.resource.namespace);
        let decision = if approval_required(self.config.operator.approval_policy, is_production, state)
        {
            self.approver.request(incident, state).await
        } else {
            ApprovalDecision::Approved
        };
        if let ApprovalDecision::Rejected(reason) = decision {
            let artefact = crate::approval::render_proposal(incident, state);
            warn!(
                incident_id = %incident.id,
                correlation_key = %incident.correlation_key,
                reason = %reason,
                proposal = %artefact,
                "apply rejected"
            );
            state.push_message(PipelineStage::Apply, format!("apply rejected: {}", reason));
            return (IncidentStatus::Rejected, None);
        }

        incident.status = IncidentStatus::Applying;
        state.current_stage = PipelineStage::Apply;
        match self.apply_and_watch(incident, state, &fix, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(incident_id = %incident.id, error = %e, "apply failed");
                state.push_message(PipelineStage::Apply, format!("apply failed: {}", e));
                (IncidentStatus::Failed, None)
            }
        }
    }

    async fn verify_in_shadow(
        &self,
        incident: &Incident,
        state: &mut PipelineState,
        fix: &FixProposal,
        plan: &VerificationPlan,
        cancel: &CancellationToken,
    ) -> bool {
        let changes_map = candidate_changes(fix);
        let changes = match ChangeSet::parse(&changes_map) {
            Ok(changes) => changes,
            Err(e) => {
                state.push_message(PipelineStage::Shadow, format!("invalid changes: {}", e));
                return false;
            }
        };
        let duration = Duration::from_secs(
            plan.duration_seconds
                .min(self.config.shadow.verification_timeout_seconds),
        );

        for attempt in 0..MAX_SHADOW_ATTEMPTS {
            if attempt > 0 {
                let delay = self
                    .retry_delays
                    .get(attempt - 1)
                    .copied()
                    .unwrap_or(Duration::from_secs(90));
                debug!(
                    incident_id = %incident.id,
                    attempt,
                    delay_seconds = delay.as_secs(),
                    "retrying shadow verification"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut env = match self
                .shadow
                .create(
                    &incident.resource.namespace,
                    &incident.resource.name,
                    incident.resource.kind.clone(),
                )
                .await
            {
                Ok(env) => env,
                Err(e) => {
                    state.push_message(PipelineStage::Shadow, format!("shadow create failed: {}", e));
                    metrics::shadow_retry("create_failed", attempt as u32 + 1);
                    continue;
                }
            };
            state.shadow_env_id = Some(env.id.clone());
            state.push_message(
                PipelineStage::Shadow,
                format!("attempt {}: shadow {} in {}", attempt + 1, env.id, env.namespace),
            );

            let passed = if env.status == ShadowStatus::Failed {
                false
            } else {
                self.shadow
                    .run_verification(&mut env, &changes, &fix.manifests, duration, cancel)
                    .await
                    .unwrap_or(false)
            };

            if let Some(raw) = env.test_results.get("security_report") {
                state.security_report = serde_json::from_value(raw.clone()).ok();
            }
            state.shadow_logs.extend(env.logs.clone());
            state.shadow_passed = Some(passed);

            if self.config.shadow.auto_cleanup {
                self.shadow.cleanup(&mut env).await;
            }

            metrics::shadow_retry(if passed { "passed" } else { "failed" }, attempt as u32 + 1);
            if passed {
                return true;
            }
            // A security block is deterministic; retrying cannot change it.
            if state
                .security_report
                .as_ref()
                .map(|r| !r.passed)
                .unwrap_or(false)
            {
                state.push_message(
                    PipelineStage::Shadow,
                    "security gate blocked, not retrying".to_string(),
                );
                return false;
            }
        }
        false
    }

    async fn apply_and_watch(
        &self,
        incident: &Incident,
        state: &mut PipelineState,
        fix: &FixProposal,
        cancel: &CancellationToken,
    ) -> Result<(IncidentStatus, Option<RollbackOutcome>)> {
        let snapshot: Value = self.executor.snapshot(&incident.resource).await?;
        let baseline = self.rollback.measure_error_rate(&incident.resource).await;

        self.executor.apply(&incident.resource, fix).await?;
        state.push_message(
            PipelineStage::Apply,
            format!("{} fix applied to {}", fix.kind, incident.resource),
        );

        if !self.config.rollback.rollback_enabled {
            return Ok((IncidentStatus::Resolved, None));
        }
        let outcome = self
            .rollback
            .watch(&incident.resource, &snapshot, baseline, cancel)
            .await;
        let status = match &outcome {
            RollbackOutcome::Healthy | RollbackOutcome::Cancelled => IncidentStatus::Resolved,
            RollbackOutcome::RolledBack { reason } => {
                state.push_message(PipelineStage::Apply, format!("rolled back: {}", reason));
                IncidentStatus::Failed
            }
            RollbackOutcome::RollbackFailed { reason, error } => {
                state.push_message(
                    PipelineStage::Apply,
                    format!("rollback for {} failed: {}", reason, error),
                );
                IncidentStatus::Failed
            }
        };
        Ok((status, Some(outcome)))
    }
}

/// Derive the shadow change map from a fix proposal.
pub fn candidate_changes(fix: &FixProposal) -> BTreeMap<String, Value> {
    let mut changes = BTreeMap::new();
    if let Some(image) = fix.proposed_image() {
        changes.insert("image".to_string(), Value::String(image));
    }
    for manifest in fix.manifests.values() {
        if let Ok(patch) = serde_yaml::from_str::<Value>(manifest) {
            if patch.get("spec").is_some() {
                changes.insert("patch".to_string(), patch);
                break;
            }
        }
    }
    for command in &fix.commands {
        if let Some(position) = command.find("--replicas=") {
            let rest = &command[position + "--replicas=".len()..];
            if let Some(replicas) = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<i64>().ok())
            {
                changes.insert("replicas".to_string(), Value::from(replicas));
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::FixKind;

    #[test]
    fn changes_derive_image_patch_and_replicas() {
        let mut fix = FixProposal::manual("fix");
        fix.kind = FixKind::Patch;
        fix.manifests.insert(
            "patch.yaml".to_string(),
            "spec:\n  template:\n    spec:\n      containers:\n        - name: api\n          image: demo:2\n".to_string(),
        );
        fix.commands
            .push("kubectl scale deployment/demo --replicas=3".to_string());

        let changes = candidate_changes(&fix);
        assert_eq!(changes["image"], Value::String("demo:2".to_string()));
        assert!(changes.contains_key("patch"));
        assert_eq!(changes["replicas"], Value::from(3));
    }

    #[test]
    fn empty_proposal_derives_no_changes() {
        let fix = FixProposal::manual("look at it");
        assert!(candidate_changes(&fix).is_empty());
    }
}
