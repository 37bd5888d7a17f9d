//! In-memory cluster for offline demos and tests
//!
//! Implements the same `ClusterOps` surface as the kube-backed client over a
//! small state table, with knobs for readiness, restarts, logs, and injected
//! API failures.

use crate::ops::ClusterOps;
use aegis_common::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One pod in the mock state
#[derive(Debug, Clone)]
pub struct PodFixture {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restart_count: i32,
    pub waiting_reason: Option<String>,
    pub oom_killed: bool,
    pub labels: BTreeMap<String, String>,
}

impl PodFixture {
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: "Running".to_string(),
            ready: true,
            restart_count: 0,
            waiting_reason: None,
            oom_killed: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Default)]
struct MockState {
    namespaces: HashMap<String, BTreeMap<String, String>>,
    quota_namespaces: HashSet<String>,
    policy_namespaces: HashSet<String>,
    deployments: HashMap<(String, String), Value>,
    deployment_status: HashMap<(String, String), (i32, i32)>,
    pods: HashMap<String, Vec<PodFixture>>,
    services: HashMap<String, Vec<(String, i32)>>,
    logs: HashMap<String, Vec<String>>,
    events: HashMap<String, Vec<String>>,
    deleted_namespaces: Vec<String>,
    unready_namespaces: HashSet<String>,
    all_namespaces_unready: bool,
    fail_ops: HashMap<String, u32>,
}

impl MockState {
    fn is_unready(&self, namespace: &str) -> bool {
        self.all_namespaces_unready || self.unready_namespaces.contains(namespace)
    }
}

/// In-memory `ClusterOps` implementation
#[derive(Default)]
pub struct MockCluster {
    state: RwLock<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster
            .state
            .write()
            .namespaces
            .insert("default".to_string(), BTreeMap::new());
        cluster
    }

    /// Seed a deployment plus one ready pod per replica.
    pub fn add_deployment(&self, namespace: &str, name: &str, image: &str, replicas: i32) {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {"app": name},
            },
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{"name": name, "image": image}]},
                },
            },
        });
        let mut state = self.state.write();
        state.namespaces.entry(namespace.to_string()).or_default();
        state
            .deployments
            .insert((namespace.to_string(), name.to_string()), manifest);
        state
            .deployment_status
            .insert((namespace.to_string(), name.to_string()), (replicas, replicas));
        let ready = !state.is_unready(namespace);
        let pods = state.pods.entry(namespace.to_string()).or_default();
        for i in 0..replicas {
            let mut fixture = PodFixture::running(format!("{}-{}", name, i));
            fixture.ready = ready;
            fixture.labels.insert("app".to_string(), name.to_string());
            pods.push(fixture);
        }
    }

    pub fn add_pod(&self, namespace: &str, fixture: PodFixture) {
        let mut state = self.state.write();
        state.namespaces.entry(namespace.to_string()).or_default();
        state.pods.entry(namespace.to_string()).or_default().push(fixture);
    }

    pub fn add_service(&self, namespace: &str, name: &str, port: i32) {
        let mut state = self.state.write();
        state
            .services
            .entry(namespace.to_string())
            .or_default()
            .push((name.to_string(), port));
    }

    /// Override the ready/desired replica status reported for a deployment.
    pub fn set_deployment_status(&self, namespace: &str, name: &str, ready: i32, desired: i32) {
        self.state
            .write()
            .deployment_status
            .insert((namespace.to_string(), name.to_string()), (ready, desired));
    }

    /// Pods created in this namespace from now on come up unready.
    pub fn set_namespace_unready(&self, namespace: &str, unready: bool) {
        let mut state = self.state.write();
        if unready {
            state.unready_namespaces.insert(namespace.to_string());
        } else {
            state.unready_namespaces.remove(namespace);
        }
    }

    /// Pods created anywhere from now on come up unready.
    pub fn set_all_namespaces_unready(&self, unready: bool) {
        self.state.write().all_namespaces_unready = unready;
    }

    pub fn set_pod_restarts(&self, namespace: &str, restarts: i32) {
        let mut state = self.state.write();
        if let Some(pods) = state.pods.get_mut(namespace) {
            for pod in pods {
                pod.restart_count = restarts;
            }
        }
    }

    pub fn push_logs(&self, namespace: &str, lines: &[&str]) {
        let mut state = self.state.write();
        state
            .logs
            .entry(namespace.to_string())
            .or_default()
            .extend(lines.iter().map(|l| l.to_string()));
    }

    pub fn clear_logs(&self, namespace: &str) {
        self.state.write().logs.remove(namespace);
    }

    pub fn push_event(&self, namespace: &str, event: &str) {
        self.state
            .write()
            .events
            .entry(namespace.to_string())
            .or_default()
            .push(event.to_string());
    }

    /// Fail the next `count` invocations of the named operation.
    pub fn fail_op(&self, operation: &str, count: u32) {
        self.state
            .write()
            .fail_ops
            .insert(operation.to_string(), count);
    }

    pub fn deleted_namespaces(&self) -> Vec<String> {
        self.state.read().deleted_namespaces.clone()
    }

    pub fn namespace_labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.state.read().namespaces.get(namespace).cloned()
    }

    pub fn has_quota(&self, namespace: &str) -> bool {
        self.state.read().quota_namespaces.contains(namespace)
    }

    pub fn has_deny_all_policy(&self, namespace: &str) -> bool {
        self.state.read().policy_namespaces.contains(namespace)
    }

    pub fn deployment_manifest(&self, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .read()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn check_fail(&self, operation: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(remaining) = state.fail_ops.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::ClusterApi(format!("{}: injected failure", operation)));
            }
        }
        Ok(())
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').all(|clause| {
        let mut parts = clause.splitn(2, '=');
        let key = parts.next().unwrap_or_default().trim();
        let value = parts.next().unwrap_or_default().trim();
        labels.get(key).map(String::as_str) == Some(value)
    })
}

fn pod_to_value(namespace: &str, fixture: &PodFixture) -> Value {
    let state = match &fixture.waiting_reason {
        Some(reason) => json!({"waiting": {"reason": reason}}),
        None => json!({"running": {}}),
    };
    let last_state = if fixture.oom_killed {
        json!({"terminated": {"exitCode": 137, "reason": "OOMKilled"}})
    } else {
        Value::Null
    };
    json!({
        "metadata": {
            "name": fixture.name,
            "namespace": namespace,
            "labels": fixture.labels,
        },
        "spec": {"containers": [{"name": "main", "image": "mock"}]},
        "status": {
            "phase": fixture.phase,
            "containerStatuses": [{
                "name": "main",
                "ready": fixture.ready,
                "restartCount": fixture.restart_count,
                "image": "mock",
                "imageID": "",
                "state": state,
                "lastState": last_state,
            }],
        },
    })
}

/// Strategic-merge approximation: objects merge recursively, arrays of
/// named objects merge by `name`, everything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (Value::Array(target_items), Value::Array(patch_items))
            if patch_items.iter().all(|i| i.get("name").is_some()) =>
        {
            for patch_item in patch_items {
                let name = patch_item.get("name").cloned();
                match target_items
                    .iter_mut()
                    .find(|t| t.get("name") == name.as_ref())
                {
                    Some(existing) => merge_patch(existing, patch_item),
                    None => target_items.push(patch_item.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterOps for MockCluster {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        self.check_fail("list pods")?;
        let state = self.state.read();
        let fixtures = state.pods.get(namespace).cloned().unwrap_or_default();
        let mut pods = Vec::new();
        for fixture in fixtures {
            if let Some(selector) = label_selector {
                if !matches_selector(&fixture.labels, selector) {
                    continue;
                }
            }
            pods.push(serde_json::from_value(pod_to_value(namespace, &fixture))?);
        }
        Ok(pods)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.check_fail("get pod")?;
        let state = self.state.read();
        let Some(fixture) = state
            .pods
            .get(namespace)
            .and_then(|pods| pods.iter().find(|p| p.name == name))
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(pod_to_value(namespace, fixture))?))
    }

    async fn create_pod(&self, namespace: &str, manifest: Value) -> Result<()> {
        self.check_fail("create pod")?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .unwrap_or("pod")
            .to_string();
        let labels = manifest["metadata"]["labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let ready = !self.state.read().is_unready(namespace);
        let mut fixture = PodFixture::running(name);
        fixture.ready = ready;
        fixture.labels = labels;
        self.add_pod(namespace, fixture);
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        self.check_fail("list deployments")?;
        let state = self.state.read();
        let mut out = Vec::new();
        for ((ns, name), manifest) in state.deployments.iter() {
            if ns != namespace {
                continue;
            }
            let (ready, desired) = state
                .deployment_status
                .get(&(ns.clone(), name.clone()))
                .copied()
                .unwrap_or((1, 1));
            let mut value = manifest.clone();
            value["status"] = json!({
                "replicas": desired,
                "readyReplicas": ready,
                "availableReplicas": ready,
                "unavailableReplicas": (desired - ready).max(0),
            });
            out.push(serde_json::from_value(value)?);
        }
        Ok(out)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.check_fail("get deployment")?;
        let deployments = self.list_deployments(namespace).await?;
        Ok(deployments
            .into_iter()
            .find(|d| d.metadata.name.as_deref() == Some(name)))
    }

    async fn create_deployment(&self, namespace: &str, manifest: Value) -> Result<()> {
        self.check_fail("create deployment")?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::Input("deployment manifest missing metadata.name".into()))?
            .to_string();
        let replicas = manifest["spec"]["replicas"].as_i64().unwrap_or(1) as i32;
        {
            let mut state = self.state.write();
            if !state.namespaces.contains_key(namespace) {
                return Err(Error::ClusterApi(format!(
                    "create deployment: 404 NotFound namespace {} not found",
                    namespace
                )));
            }
            state
                .deployments
                .insert((namespace.to_string(), name.clone()), manifest.clone());
            state
                .deployment_status
                .insert((namespace.to_string(), name.clone()), (replicas, replicas));
            let ready = !state.is_unready(namespace);
            let pods = state.pods.entry(namespace.to_string()).or_default();
            let template_labels: BTreeMap<String, String> = manifest["spec"]["template"]
                ["metadata"]["labels"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            for i in 0..replicas {
                let mut fixture = PodFixture::running(format!("{}-{}", name, i));
                fixture.ready = ready;
                fixture.labels = template_labels.clone();
                pods.push(fixture);
            }
        }
        Ok(())
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        self.check_fail("patch deployment")?;
        let mut state = self.state.write();
        let key = (namespace.to_string(), name.to_string());
        let Some(manifest) = state.deployments.get_mut(&key) else {
            return Err(Error::ClusterApi(format!(
                "patch deployment: 404 NotFound {}/{}",
                namespace, name
            )));
        };
        merge_patch(manifest, &patch);
        Ok(())
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, manifest: Value) -> Result<()> {
        self.check_fail("replace deployment")?;
        let mut state = self.state.write();
        state
            .deployments
            .insert((namespace.to_string(), name.to_string()), manifest);
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.check_fail("scale deployment")?;
        let mut state = self.state.write();
        let key = (namespace.to_string(), name.to_string());
        let Some(manifest) = state.deployments.get_mut(&key) else {
            return Err(Error::ClusterApi(format!(
                "scale deployment: 404 NotFound {}/{}",
                namespace, name
            )));
        };
        manifest["spec"]["replicas"] = json!(replicas);
        state.deployment_status.insert(key, (replicas, replicas));
        Ok(())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_fail("restart deployment")?;
        let mut state = self.state.write();
        if let Some(pods) = state.pods.get_mut(namespace) {
            for pod in pods.iter_mut().filter(|p| p.name.starts_with(name)) {
                pod.restart_count = 0;
                pod.ready = true;
            }
        }
        Ok(())
    }

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        self.check_fail("create namespace")?;
        self.state
            .write()
            .namespaces
            .insert(name.to_string(), labels);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.check_fail("delete namespace")?;
        let mut state = self.state.write();
        state.namespaces.remove(name);
        state.pods.remove(name);
        state.logs.remove(name);
        state.quota_namespaces.remove(name);
        state.policy_namespaces.remove(name);
        state
            .deployments
            .retain(|(ns, _), _| ns != name);
        state.deleted_namespaces.push(name.to_string());
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        self.check_fail("get namespace")?;
        Ok(self.state.read().namespaces.contains_key(name))
    }

    async fn list_namespaces(&self, label_selector: Option<&str>) -> Result<Vec<String>> {
        self.check_fail("list namespaces")?;
        let state = self.state.read();
        let mut names: Vec<String> = state
            .namespaces
            .iter()
            .filter(|(_, labels)| match label_selector {
                Some(selector) => matches_selector(labels, selector),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn apply_resource_quota(&self, namespace: &str, _cpu: &str, _memory: &str) -> Result<()> {
        self.check_fail("create resource quota")?;
        self.state
            .write()
            .quota_namespaces
            .insert(namespace.to_string());
        Ok(())
    }

    async fn apply_deny_all_policy(&self, namespace: &str) -> Result<()> {
        self.check_fail("create network policy")?;
        self.state
            .write()
            .policy_namespaces
            .insert(namespace.to_string());
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        _name: &str,
        tail_lines: i64,
        _since_seconds: Option<i64>,
    ) -> Result<String> {
        self.check_fail("read pod logs")?;
        let state = self.state.read();
        let lines = state.logs.get(namespace).cloned().unwrap_or_default();
        let start = lines.len().saturating_sub(tail_lines.max(0) as usize);
        Ok(lines[start..].join("\n"))
    }

    async fn recent_events(&self, namespace: &str, _name: Option<&str>) -> Result<Vec<String>> {
        self.check_fail("list events")?;
        Ok(self
            .state
            .read()
            .events
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        self.check_fail("list services")?;
        let state = self.state.read();
        let mut out = Vec::new();
        for (name, port) in state.services.get(namespace).cloned().unwrap_or_default() {
            let value = json!({
                "metadata": {"name": name, "namespace": namespace},
                "spec": {"ports": [{"port": port}]},
            });
            out.push(serde_json::from_value(value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{deployment_replicas, pod_is_ready, pod_oom_killed};

    #[tokio::test]
    async fn deployment_round_trip_with_status() {
        let cluster = MockCluster::new();
        cluster.add_deployment("default", "web", "nginx:1.25", 3);
        cluster.set_deployment_status("default", "web", 1, 3);

        let deployment = cluster
            .get_deployment("default", "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployment_replicas(&deployment), (1, 3));

        let pods = cluster.list_pods("default", Some("app=web")).await.unwrap();
        assert_eq!(pods.len(), 3);
        assert!(pods.iter().all(pod_is_ready));
    }

    #[tokio::test]
    async fn pod_fixtures_expose_failure_state() {
        let cluster = MockCluster::new();
        let mut fixture = PodFixture::running("demo-api-7fbd");
        fixture.ready = false;
        fixture.restart_count = 7;
        fixture.waiting_reason = Some("CrashLoopBackOff".to_string());
        fixture.oom_killed = true;
        cluster.add_pod("production", fixture);

        let pod = cluster
            .get_pod("production", "demo-api-7fbd")
            .await
            .unwrap()
            .unwrap();
        assert!(!pod_is_ready(&pod));
        assert!(pod_oom_killed(&pod));
    }

    #[tokio::test]
    async fn strategic_patch_merges_containers_by_name() {
        let cluster = MockCluster::new();
        cluster.add_deployment("default", "web", "nginx:1.25", 1);
        cluster
            .patch_deployment(
                "default",
                "web",
                json!({"spec": {"template": {"spec": {"containers": [
                    {"name": "web", "image": "nginx:1.26"}
                ]}}}}),
            )
            .await
            .unwrap();

        let manifest = cluster.deployment_manifest("default", "web").unwrap();
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["image"],
            "nginx:1.26"
        );
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["name"],
            "web"
        );
    }

    #[tokio::test]
    async fn delete_namespace_is_benign_when_absent() {
        let cluster = MockCluster::new();
        cluster.delete_namespace("ghost").await.unwrap();
        cluster.delete_namespace("ghost").await.unwrap();
        assert_eq!(cluster.deleted_namespaces().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_fire_once_per_count() {
        let cluster = MockCluster::new();
        cluster.fail_op("create namespace", 1);
        assert!(cluster
            .create_namespace("x", BTreeMap::new())
            .await
            .is_err());
        assert!(cluster.create_namespace("x", BTreeMap::new()).await.is_ok());
    }
}
