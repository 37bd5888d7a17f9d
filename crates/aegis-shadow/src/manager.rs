//! Shadow environment lifecycle
//!
//! Creates an isolated namespace, clones the source workload into it,
//! applies candidate changes, drives the security gate chain and health
//! monitoring, and tears the namespace down. Environments are owned
//! exclusively by this manager until destroyed.

use crate::changes::{ChangeOp, ChangeSet};
use crate::health::{HealthMonitor, PASS_THRESHOLD};
use aegis_cluster::{ops, ClusterOps};
use aegis_common::config::ShadowConfig;
use aegis_common::utils::{sanitize_name, short_id};
use aegis_common::{metrics, Error, ResourceKind, Result, ShadowEnvironment, ShadowStatus};
use aegis_security::{ScanContext, SecurityPipeline};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SHADOW_LABEL: &str = "aegis.io/shadow";

/// Manager for isolated workload clones
pub struct ShadowManager {
    cluster: Arc<dyn ClusterOps>,
    security: Arc<SecurityPipeline>,
    config: ShadowConfig,
    semaphore: Arc<Semaphore>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    active: RwLock<HashMap<String, ShadowEnvironment>>,
    poll_interval: Duration,
}

impl ShadowManager {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        security: Arc<SecurityPipeline>,
        config: ShadowConfig,
    ) -> Self {
        let bound = config.max_concurrent_shadows.max(1);
        Self {
            cluster,
            security,
            config,
            semaphore: Arc::new(Semaphore::new(bound)),
            permits: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Override the readiness/health polling cadence (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Environments currently tracked by the manager.
    pub fn list_active(&self) -> Vec<ShadowEnvironment> {
        self.active.read().values().cloned().collect()
    }

    /// Create the shadow environment for a source workload. Infrastructure
    /// failures surface as `status = Failed` on the returned environment;
    /// only invalid input is an `Err`.
    pub async fn create(
        &self,
        source_namespace: &str,
        source_name: &str,
        source_kind: ResourceKind,
    ) -> Result<ShadowEnvironment> {
        if !matches!(source_kind, ResourceKind::Deployment | ResourceKind::Pod) {
            return Err(Error::Input(format!(
                "unsupported source kind for shadowing: {}",
                source_kind
            )));
        }

        // Blocks when max_concurrent environments are live.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("shadow manager shut down")))?;

        let id = sanitize_name(&format!("{}-{}", source_name, short_id()));
        let namespace = sanitize_name(&format!("{}-{}", self.config.namespace_prefix, id));
        let mut env = ShadowEnvironment {
            id: id.clone(),
            namespace,
            source_namespace: source_namespace.to_string(),
            source_name: source_name.to_string(),
            source_kind,
            status: ShadowStatus::Pending,
            created_at: Utc::now(),
            health_score: 0.0,
            logs: Vec::new(),
            error: None,
            test_results: BTreeMap::new(),
        };
        self.permits.lock().insert(id.clone(), permit);

        info!(
            shadow_id = %env.id,
            namespace = %env.namespace,
            source = %format!("{}/{}/{}", source_namespace, env.source_kind, source_name),
            "creating shadow environment"
        );
        env.transition(ShadowStatus::Creating);

        if let Err(e) = self.provision(&env).await {
            return Ok(self.fail_create(env, format!("provisioning failed: {}", e)));
        }
        env.logs.push(format!("namespace {} provisioned", env.namespace));

        match self.clone_source(&env).await {
            Ok(manifest) => {
                if let Err(e) = self.cluster.create_deployment(&env.namespace, manifest).await {
                    return Ok(self.fail_create(env, format!("clone creation failed: {}", e)));
                }
                env.logs.push(format!("cloned {} into shadow", env.source_name));
            }
            Err(e) => {
                return Ok(self.fail_create(env, format!("source clone failed: {}", e)));
            }
        }

        if self.wait_ready(&env).await {
            env.transition(ShadowStatus::Ready);
            env.logs.push("workload ready".to_string());
        } else {
            return Ok(self.fail_create(
                env,
                format!(
                    "workload not ready within {}s",
                    self.config.readiness_timeout_seconds
                ),
            ));
        }

        self.track(&env);
        Ok(env)
    }

    /// An environment that never became usable must not keep holding a
    /// concurrency slot; its namespace stays behind for `cleanup`.
    fn fail_create(&self, mut env: ShadowEnvironment, reason: String) -> ShadowEnvironment {
        self.mark_failed(&mut env, reason);
        self.permits.lock().remove(&env.id);
        env
    }

    async fn provision(&self, env: &ShadowEnvironment) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(SHADOW_LABEL.to_string(), "true".to_string());
        labels.insert(
            "aegis.io/source-namespace".to_string(),
            env.source_namespace.clone(),
        );
        self.cluster.create_namespace(&env.namespace, labels).await?;
        self.cluster
            .apply_resource_quota(
                &env.namespace,
                &self.config.cpu_request,
                &self.config.memory_request,
            )
            .await?;
        self.cluster.apply_deny_all_policy(&env.namespace).await?;
        Ok(())
    }

    async fn clone_source(&self, env: &ShadowEnvironment) -> Result<Value> {
        match env.source_kind {
            ResourceKind::Deployment => {
                let deployment = self
                    .cluster
                    .get_deployment(&env.source_namespace, &env.source_name)
                    .await?
                    .ok_or_else(|| {
                        Error::Input(format!(
                            "source deployment {}/{} not found",
                            env.source_namespace, env.source_name
                        ))
                    })?;
                let mut manifest = serde_json::to_value(&deployment)?;
                strip_cluster_fields(&mut manifest);
                manifest["metadata"]["namespace"] = json!(env.namespace);
                manifest["metadata"]["labels"][SHADOW_LABEL] = json!("true");
                // One replica fits under the shadow quota.
                manifest["spec"]["replicas"] = json!(1);
                Ok(manifest)
            }
            ResourceKind::Pod => {
                let pod = self
                    .cluster
                    .get_pod(&env.source_namespace, &env.source_name)
                    .await?
                    .ok_or_else(|| {
                        Error::Input(format!(
                            "source pod {}/{} not found",
                            env.source_namespace, env.source_name
                        ))
                    })?;
                let mut pod_value = serde_json::to_value(&pod)?;
                strip_cluster_fields(&mut pod_value);
                let mut spec = pod_value.get("spec").cloned().unwrap_or_else(|| json!({}));
                if let Some(spec_map) = spec.as_object_mut() {
                    // Deployment pods must be restartable and unpinned.
                    spec_map.remove("restartPolicy");
                    spec_map.remove("nodeName");
                }
                let labels = json!({"app": env.source_name, SHADOW_LABEL: "true"});
                Ok(json!({
                    "metadata": {
                        "name": env.source_name,
                        "namespace": env.namespace,
                        "labels": labels,
                    },
                    "spec": {
                        "replicas": 1,
                        "selector": {"matchLabels": {"app": env.source_name}},
                        "template": {
                            "metadata": {"labels": labels},
                            "spec": spec,
                        },
                    },
                }))
            }
            _ => Err(Error::Input(format!(
                "unsupported source kind: {}",
                env.source_kind
            ))),
        }
    }

    async fn wait_ready(&self, env: &ShadowEnvironment) -> bool {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.readiness_timeout_seconds);
        loop {
            match self.cluster.list_pods(&env.namespace, None).await {
                Ok(pods) if !pods.is_empty() && pods.iter().all(ops::pod_is_ready) => {
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(shadow_id = %env.id, error = %e, "readiness poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Apply a candidate change set to the cloned workload.
    pub async fn apply_changes(
        &self,
        env: &mut ShadowEnvironment,
        changes: &ChangeSet,
    ) -> Result<()> {
        let container = self.primary_container(env).await?;
        for op in changes.ops() {
            match op {
                ChangeOp::Image(image) => {
                    self.patch_container(env, &container, json!({"image": image}))
                        .await?;
                }
                ChangeOp::Replicas(replicas) => {
                    self.cluster
                        .scale_deployment(&env.namespace, &env.source_name, *replicas)
                        .await?;
                }
                ChangeOp::Env(vars) => {
                    let env_list: Vec<Value> = vars
                        .iter()
                        .map(|(name, value)| json!({"name": name, "value": value}))
                        .collect();
                    self.patch_container(env, &container, json!({"env": env_list}))
                        .await?;
                }
                ChangeOp::Resources(resources) => {
                    self.patch_container(env, &container, json!({"resources": resources}))
                        .await?;
                }
                ChangeOp::Command(command) => {
                    self.patch_container(env, &container, json!({"command": command}))
                        .await?;
                }
                ChangeOp::Args(args) => {
                    self.patch_container(env, &container, json!({"args": args}))
                        .await?;
                }
                ChangeOp::Patch(patch) => {
                    self.cluster
                        .patch_deployment(&env.namespace, &env.source_name, patch.clone())
                        .await?;
                }
            }
            env.logs.push(format!("applied change: {}", change_name(op)));
        }
        Ok(())
    }

    async fn primary_container(&self, env: &ShadowEnvironment) -> Result<String> {
        let deployment = self
            .cluster
            .get_deployment(&env.namespace, &env.source_name)
            .await?
            .ok_or_else(|| {
                Error::ClusterApi(format!(
                    "shadow workload {}/{} missing",
                    env.namespace, env.source_name
                ))
            })?;
        let name = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| Error::Validation("shadow workload has no containers".to_string()))?;
        Ok(name)
    }

    async fn patch_container(
        &self,
        env: &ShadowEnvironment,
        container: &str,
        mut fields: Value,
    ) -> Result<()> {
        fields["name"] = json!(container);
        let patch = json!({
            "spec": {"template": {"spec": {"containers": [fields]}}}
        });
        self.cluster
            .patch_deployment(&env.namespace, &env.source_name, patch)
            .await
    }

    /// Apply changes, run the security gate chain, then monitor health for
    /// `duration`. Returns whether the verification passed; gate and health
    /// failures set `status = Failed`.
    pub async fn run_verification(
        &self,
        env: &mut ShadowEnvironment,
        changes: &ChangeSet,
        manifests: &BTreeMap<String, String>,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if env.status != ShadowStatus::Ready {
            return Err(Error::Validation(format!(
                "cannot verify environment in state {}",
                env.status
            )));
        }
        let verification_start = Utc::now();
        env.transition(ShadowStatus::Testing);
        self.track(env);

        if let Err(e) = self.apply_changes(env, changes).await {
            self.mark_failed(env, format!("change application failed: {}", e));
            metrics::shadow_verification("apply_failed", &env.source_kind);
            return Ok(false);
        }

        let mut context = ScanContext::new(env.namespace.clone(), env.source_kind.clone());
        context.image = changes.image().map(String::from);
        context.manifests = manifests.clone();
        context.service_url = self.resolve_service_url(&env.namespace).await;
        context.verification_start = verification_start;

        let report = self.security.run(&context).await;
        env.test_results.insert(
            "security_report".to_string(),
            serde_json::to_value(&report).unwrap_or(Value::Null),
        );
        if !report.passed {
            self.mark_failed(env, format!("security gate blocked: {}", report.summary));
            metrics::shadow_verification("security_blocked", &env.source_kind);
            self.record_results(env, 0.0, duration, false, verification_start);
            return Ok(false);
        }
        env.logs.push(format!("security gate: {}", report.summary));

        let monitor = HealthMonitor::new(self.cluster.clone()).with_interval(self.poll_interval);
        let verdict = monitor.monitor(&env.namespace, duration, cancel).await;
        env.health_score = verdict.score;
        env.logs.push(format!(
            "health score {:.3} over {} sample(s)",
            verdict.score,
            verdict.samples.len()
        ));
        self.record_results(env, verdict.score, duration, verdict.passed, verification_start);

        if verdict.passed {
            metrics::shadow_verification("passed", &env.source_kind);
            info!(
                shadow_id = %env.id,
                health_score = verdict.score,
                "shadow verification passed"
            );
        } else {
            self.mark_failed(
                env,
                format!(
                    "health score {:.3} below {:.2}",
                    verdict.score, PASS_THRESHOLD
                ),
            );
            metrics::shadow_verification("health_failed", &env.source_kind);
        }
        self.track(env);
        Ok(verdict.passed)
    }

    fn record_results(
        &self,
        env: &mut ShadowEnvironment,
        score: f64,
        duration: Duration,
        passed: bool,
        started: chrono::DateTime<Utc>,
    ) {
        env.test_results
            .insert("health_score".to_string(), json!(score));
        env.test_results
            .insert("duration_seconds".to_string(), json!(duration.as_secs()));
        env.test_results.insert("passed".to_string(), json!(passed));
        env.test_results
            .insert("timestamp".to_string(), json!(started.to_rfc3339()));
    }

    async fn resolve_service_url(&self, namespace: &str) -> Option<String> {
        let services = self.cluster.list_services(namespace).await.ok()?;
        let service = services.first()?;
        let name = service.metadata.name.clone()?;
        let port = service
            .spec
            .as_ref()?
            .ports
            .as_ref()?
            .first()
            .map(|p| p.port)?;
        Some(format!("http://{}.{}.svc.cluster.local:{}", name, namespace, port))
    }

    /// Delete the shadow namespace. Best-effort and idempotent: residual
    /// failures are logged and counted, never raised.
    pub async fn cleanup(&self, env: &mut ShadowEnvironment) {
        if env.status == ShadowStatus::Destroyed {
            self.untrack(&env.id);
            return;
        }
        env.transition(ShadowStatus::Cleaning);

        let delete = tokio::time::timeout(
            Duration::from_secs(self.config.cleanup_timeout_seconds),
            self.cluster.delete_namespace(&env.namespace),
        )
        .await;
        match delete {
            Ok(Ok(())) => {
                env.logs.push(format!("namespace {} deleted", env.namespace));
            }
            Ok(Err(e)) => {
                warn!(
                    shadow_id = %env.id,
                    namespace = %env.namespace,
                    error = %e,
                    "shadow namespace deletion failed, leaking"
                );
                metrics::shadow_leaked(&self.config.runtime);
                env.error.get_or_insert_with(|| format!("cleanup failed: {}", e));
            }
            Err(_) => {
                warn!(
                    shadow_id = %env.id,
                    namespace = %env.namespace,
                    "shadow namespace deletion timed out, leaking"
                );
                metrics::shadow_leaked(&self.config.runtime);
                env.error
                    .get_or_insert_with(|| "cleanup timed out".to_string());
            }
        }

        env.transition(ShadowStatus::Destroyed);
        self.untrack(&env.id);
    }

    fn mark_failed(&self, env: &mut ShadowEnvironment, reason: String) {
        warn!(shadow_id = %env.id, reason = %reason, "shadow environment failed");
        env.logs.push(reason.clone());
        env.error = Some(reason);
        env.transition(ShadowStatus::Failed);
        self.track(env);
    }

    fn track(&self, env: &ShadowEnvironment) {
        self.active.write().insert(env.id.clone(), env.clone());
        metrics::shadow_active(&self.config.runtime, self.active.read().len());
    }

    fn untrack(&self, id: &str) {
        self.active.write().remove(id);
        self.permits.lock().remove(id);
        metrics::shadow_active(&self.config.runtime, self.active.read().len());
    }
}

fn change_name(op: &ChangeOp) -> &'static str {
    match op {
        ChangeOp::Image(_) => "image",
        ChangeOp::Replicas(_) => "replicas",
        ChangeOp::Env(_) => "env",
        ChangeOp::Resources(_) => "resources",
        ChangeOp::Command(_) => "command",
        ChangeOp::Args(_) => "args",
        ChangeOp::Patch(_) => "patch",
    }
}

/// Remove cluster-injected fields so a manifest can be re-created.
pub fn strip_cluster_fields(manifest: &mut Value) {
    if let Some(object) = manifest.as_object_mut() {
        object.remove("status");
    }
    if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "resourceVersion",
            "uid",
            "selfLink",
            "creationTimestamp",
            "generation",
            "managedFields",
            "ownerReferences",
        ] {
            metadata.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cluster::MockCluster;
    use aegis_common::{ScanOutcome, SecurityFinding, SecurityReport, Severity};
    use aegis_security::{FailMode, Scanner};
    use async_trait::async_trait;

    struct BlockingImageScanner;

    #[async_trait]
    impl Scanner for BlockingImageScanner {
        fn id(&self) -> &'static str {
            "image"
        }
        fn fail_mode(&self) -> FailMode {
            FailMode::Closed
        }
        fn should_run(&self, context: &ScanContext) -> bool {
            context.image.is_some()
        }
        async fn scan(&self, context: &ScanContext) -> ScanOutcome {
            ScanOutcome {
                tool: "image".to_string(),
                passed: false,
                skipped: false,
                reason: Some("1 critical CVE".to_string()),
                findings: vec![SecurityFinding {
                    scanner: "image".to_string(),
                    severity: Severity::Critical,
                    title: "CVE-2017-7529".to_string(),
                    identifier: "CVE-2017-7529".to_string(),
                    location: context.image.clone().unwrap_or_default(),
                    raw: Value::Null,
                }],
                summary: "critical vulnerability".to_string(),
                raw: Value::Null,
            }
        }
    }

    fn fast_config() -> ShadowConfig {
        ShadowConfig {
            readiness_timeout_seconds: 1,
            cleanup_timeout_seconds: 2,
            ..Default::default()
        }
    }

    fn manager_with(
        cluster: Arc<MockCluster>,
        scanners: Vec<Arc<dyn Scanner>>,
        config: ShadowConfig,
    ) -> ShadowManager {
        ShadowManager::new(
            cluster,
            Arc::new(SecurityPipeline::new(scanners)),
            config,
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    fn seeded_cluster() -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_deployment("production", "demo-api", "demo-api:1.2.2", 3);
        cluster
    }

    #[tokio::test]
    async fn create_provisions_isolated_namespace() {
        let cluster = seeded_cluster();
        let manager = manager_with(cluster.clone(), vec![], fast_config());

        let env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();
        assert_eq!(env.status, ShadowStatus::Ready);
        assert!(env.namespace.starts_with("aegis-shadow-"));
        assert!(cluster.has_quota(&env.namespace));
        assert!(cluster.has_deny_all_policy(&env.namespace));
        let clone = cluster.deployment_manifest(&env.namespace, "demo-api").unwrap();
        assert_eq!(clone["spec"]["replicas"], 1);
        assert_eq!(clone["metadata"]["labels"][SHADOW_LABEL], "true");
        assert!(clone["metadata"].get("resourceVersion").is_none());
    }

    #[tokio::test]
    async fn verification_passes_on_healthy_clone() {
        let cluster = seeded_cluster();
        let manager = manager_with(cluster.clone(), vec![], fast_config());
        let mut env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();

        let mut raw = BTreeMap::new();
        raw.insert("image".to_string(), json!("demo-api:1.2.3-hotfix"));
        let changes = ChangeSet::parse(&raw).unwrap();

        let passed = manager
            .run_verification(
                &mut env,
                &changes,
                &BTreeMap::new(),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(passed);
        assert!(env.health_score >= PASS_THRESHOLD);
        assert_eq!(env.test_results["passed"], json!(true));

        let clone = cluster.deployment_manifest(&env.namespace, "demo-api").unwrap();
        assert_eq!(
            clone["spec"]["template"]["spec"]["containers"][0]["image"],
            "demo-api:1.2.3-hotfix"
        );
    }

    #[tokio::test]
    async fn vulnerable_image_blocks_and_fails_environment() {
        let cluster = seeded_cluster();
        let manager = manager_with(
            cluster.clone(),
            vec![Arc::new(BlockingImageScanner)],
            fast_config(),
        );
        let mut env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();

        let mut raw = BTreeMap::new();
        raw.insert("image".to_string(), json!("nginx:1.10"));
        let changes = ChangeSet::parse(&raw).unwrap();

        let passed = manager
            .run_verification(
                &mut env,
                &changes,
                &BTreeMap::new(),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!passed);
        assert_eq!(env.status, ShadowStatus::Failed);
        let report: SecurityReport =
            serde_json::from_value(env.test_results["security_report"].clone()).unwrap();
        assert!(!report.passed);

        manager.cleanup(&mut env).await;
        assert!(cluster.deleted_namespaces().contains(&env.namespace));
    }

    #[tokio::test]
    async fn unready_workload_fails_creation() {
        let cluster = seeded_cluster();
        cluster.set_all_namespaces_unready(true);
        let manager = manager_with(cluster.clone(), vec![], fast_config());

        let env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();
        assert_eq!(env.status, ShadowStatus::Failed);
        assert!(env.error.as_deref().unwrap().contains("not ready"));
    }

    #[tokio::test]
    async fn failed_creation_releases_its_concurrency_slot() {
        let cluster = seeded_cluster();
        let config = ShadowConfig {
            max_concurrent_shadows: 1,
            ..fast_config()
        };
        let manager = manager_with(cluster.clone(), vec![], config);

        cluster.fail_op("create namespace", 1);
        let failed = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();
        assert_eq!(failed.status, ShadowStatus::Failed);

        // The slot freed without any cleanup call; a second create must not
        // block on the dead environment.
        let env = tokio::time::timeout(
            Duration::from_secs(5),
            manager.create("production", "demo-api", ResourceKind::Deployment),
        )
        .await
        .expect("second create should not wait for the failed one")
        .unwrap();
        assert_eq!(env.status, ShadowStatus::Ready);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let cluster = seeded_cluster();
        let manager = manager_with(cluster.clone(), vec![], fast_config());
        let mut env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();

        manager.cleanup(&mut env).await;
        assert_eq!(env.status, ShadowStatus::Destroyed);
        let deletions = cluster.deleted_namespaces().len();

        manager.cleanup(&mut env).await;
        assert_eq!(env.status, ShadowStatus::Destroyed);
        assert_eq!(cluster.deleted_namespaces().len(), deletions);
    }

    #[tokio::test]
    async fn failed_cleanup_leaks_but_does_not_raise() {
        let cluster = seeded_cluster();
        let manager = manager_with(cluster.clone(), vec![], fast_config());
        let mut env = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();

        cluster.fail_op("delete namespace", 1);
        manager.cleanup(&mut env).await;
        assert!(env.error.as_deref().unwrap().contains("cleanup failed"));
    }

    #[tokio::test]
    async fn concurrency_bound_blocks_fourth_create() {
        let cluster = seeded_cluster();
        let config = ShadowConfig {
            max_concurrent_shadows: 1,
            ..fast_config()
        };
        let manager = Arc::new(manager_with(cluster, vec![], config));

        let first = manager
            .create("production", "demo-api", ResourceKind::Deployment)
            .await
            .unwrap();

        let blocked = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .create("production", "demo-api", ResourceKind::Deployment)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "second create should wait for a slot");

        let mut first = first;
        manager.cleanup(&mut first).await;
        let second = blocked.await.unwrap().unwrap();
        assert_eq!(second.status, ShadowStatus::Ready);
    }

    #[tokio::test]
    async fn unsupported_kind_is_rejected() {
        let manager = manager_with(seeded_cluster(), vec![], fast_config());
        let err = manager
            .create("production", "demo-svc", ResourceKind::Service)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }

    #[tokio::test]
    async fn pod_sources_are_wrapped_in_a_deployment() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_pod(
            "production",
            aegis_cluster::PodFixture::running("demo-api-7fbd"),
        );
        let manager = manager_with(cluster.clone(), vec![], fast_config());

        let env = manager
            .create("production", "demo-api-7fbd", ResourceKind::Pod)
            .await
            .unwrap();
        assert_eq!(env.status, ShadowStatus::Ready);
        let clone = cluster
            .deployment_manifest(&env.namespace, "demo-api-7fbd")
            .unwrap();
        assert_eq!(clone["spec"]["replicas"], 1);
        assert!(clone["spec"]["template"]["spec"].get("nodeName").is_none());
    }
}
