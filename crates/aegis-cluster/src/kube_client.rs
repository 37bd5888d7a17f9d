//! kube-rs backed implementation of the cluster surface

use crate::ops::ClusterOps;
use aegis_common::config::ClusterConfig;
use aegis_common::{retry_transient, Error, Result, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, Pod, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Cluster client over the Kubernetes API
pub struct KubeCluster {
    client: kube::Client,
    retry: RetryConfig,
    timeout: Duration,
}

impl KubeCluster {
    /// Connect using the configured kubeconfig, or the ambient environment
    /// (in-cluster service account or `KUBECONFIG`) when none is set.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let client = if let Some(path) = &config.kubeconfig_path {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::ClusterApi(format!("kubeconfig {}: {}", path.display(), e)))?;
            let options = KubeConfigOptions {
                context: config.context.clone(),
                ..Default::default()
            };
            let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::ClusterApi(format!("kubeconfig context: {}", e)))?;
            kube::Client::try_from(kube_config)
                .map_err(|e| Error::ClusterApi(format!("client construction: {}", e)))?
        } else {
            kube::Client::try_default()
                .await
                .map_err(|e| Error::ClusterApi(format!("cluster connection: {}", e)))?
        };

        Ok(Self {
            client,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(config.api_timeout_seconds),
        })
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, kube::Error>>,
    {
        retry_transient(&self.retry, operation, || {
            let fut = call();
            async {
                tokio::time::timeout(self.timeout, fut)
                    .await
                    .map_err(|_| Error::Timeout(format!("{} exceeded {:?}", operation, self.timeout)))?
                    .map_err(|e| to_cluster_error(operation, e))
            }
        })
        .await
    }
}

fn to_cluster_error(operation: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) => Error::ClusterApi(format!(
            "{}: {} {} {}",
            operation, ae.code, ae.reason, ae.message
        )),
        other => Error::ClusterApi(format!("{}: {}", operation, other)),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.run("list pods", || api.list(&params)).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.run("get pod", || api.get_opt(name)).await
    }

    async fn create_pod(&self, namespace: &str, manifest: Value) -> Result<()> {
        let pod: Pod = serde_json::from_value(manifest)?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams::default();
        self.run("create pod", || api.create(&params, &pod)).await?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default();
        let list = self.run("list deployments", || api.list(&params)).await?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.run("get deployment", || api.get_opt(name)).await
    }

    async fn create_deployment(&self, namespace: &str, manifest: Value) -> Result<()> {
        let deployment: Deployment = serde_json::from_value(manifest)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams::default();
        self.run("create deployment", || api.create(&params, &deployment))
            .await?;
        Ok(())
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::default();
        let patch = Patch::Strategic(patch);
        self.run("patch deployment", || api.patch(name, &params, &patch))
            .await?;
        Ok(())
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, manifest: Value) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let current = self.run("get deployment", || api.get_opt(name)).await?;
        match current {
            Some(existing) => {
                let mut deployment: Deployment = serde_json::from_value(manifest)?;
                deployment.metadata.resource_version = existing.metadata.resource_version;
                deployment.metadata.uid = existing.metadata.uid;
                let params = PostParams::default();
                self.run("replace deployment", || api.replace(name, &params, &deployment))
                    .await?;
            }
            None => {
                debug!(namespace, name, "deployment absent, recreating from manifest");
                self.create_deployment(namespace, manifest).await?;
            }
        }
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::default();
        let patch = Patch::Merge(json!({"spec": {"replicas": replicas}}));
        self.run("scale deployment", || api.patch_scale(name, &params, &patch))
            .await?;
        Ok(())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            "kubectl.kubernetes.io/restartedAt": Utc::now().to_rfc3339(),
                        }
                    }
                }
            }
        });
        let params = PatchParams::default();
        let patch = Patch::Strategic(patch);
        self.run("restart deployment", || api.patch(name, &params, &patch))
            .await?;
        Ok(())
    }

    async fn create_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let namespace: Namespace = serde_json::from_value(json!({
            "metadata": {"name": name, "labels": labels}
        }))?;
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = PostParams::default();
        self.run("create namespace", || api.create(&params, &namespace))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(name, "namespace already gone");
                Ok(())
            }
            Err(e) => Err(to_cluster_error("delete namespace", e)),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = self.run("get namespace", || api.get_opt(name)).await?;
        Ok(found.is_some())
    }

    async fn list_namespaces(&self, label_selector: Option<&str>) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.run("list namespaces", || api.list(&params)).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn apply_resource_quota(&self, namespace: &str, cpu: &str, memory: &str) -> Result<()> {
        let quota: ResourceQuota = serde_json::from_value(json!({
            "metadata": {"name": "shadow-quota", "namespace": namespace},
            "spec": {
                "hard": {
                    "requests.cpu": cpu,
                    "requests.memory": memory,
                    "pods": "10",
                }
            }
        }))?;
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams::default();
        self.run("create resource quota", || api.create(&params, &quota))
            .await?;
        Ok(())
    }

    async fn apply_deny_all_policy(&self, namespace: &str) -> Result<()> {
        let policy: NetworkPolicy = serde_json::from_value(json!({
            "metadata": {"name": "deny-all", "namespace": namespace},
            "spec": {
                "podSelector": {},
                "policyTypes": ["Ingress", "Egress"],
            }
        }))?;
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams::default();
        self.run("create network policy", || api.create(&params, &policy))
            .await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: i64,
        since_seconds: Option<i64>,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            tail_lines: Some(tail_lines),
            since_seconds,
            ..LogParams::default()
        };
        self.run("read pod logs", || api.logs(name, &params)).await
    }

    async fn recent_events(&self, namespace: &str, name: Option<&str>) -> Result<Vec<String>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(name) = name {
            params = params.fields(&format!("involvedObject.name={}", name));
        }
        let list = match self.run("list events", || api.list(&params)).await {
            Ok(list) => list,
            Err(e) => {
                warn!(namespace, error = %e, "event listing failed");
                return Ok(Vec::new());
            }
        };
        let mut events: Vec<String> = list
            .items
            .into_iter()
            .map(|e| {
                format!(
                    "{} {} {}: {}",
                    e.last_timestamp
                        .map(|t| t.0.to_rfc3339())
                        .unwrap_or_default(),
                    e.type_.unwrap_or_default(),
                    e.reason.unwrap_or_default(),
                    e.message.unwrap_or_default(),
                )
            })
            .collect();
        events.sort();
        Ok(events)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default();
        let list = self.run("list services", || api.list(&params)).await?;
        Ok(list.items)
    }
}
