//! Fix application and rollback execution
//!
//! Approved fixes reach the cluster through the same narrow API surface as
//! everything else: proposal commands are interpreted into typed cluster
//! calls, never handed to a shell.

use aegis_cluster::ClusterOps;
use aegis_common::{metrics, Error, FixProposal, ResourceKind, ResourceRef, Result};
use aegis_shadow::strip_cluster_fields;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FixExecutor {
    cluster: Arc<dyn ClusterOps>,
}

impl FixExecutor {
    pub fn new(cluster: Arc<dyn ClusterOps>) -> Self {
        Self { cluster }
    }

    /// The deployment a fix for this resource lands on. Pod incidents are
    /// remediated through their owning deployment.
    pub async fn target_deployment(&self, resource: &ResourceRef) -> Result<ResourceRef> {
        match resource.kind {
            ResourceKind::Deployment => Ok(resource.clone()),
            ResourceKind::Pod => {
                let deployments = self.cluster.list_deployments(&resource.namespace).await?;
                deployments
                    .into_iter()
                    .filter_map(|d| d.metadata.name)
                    .filter(|name| resource.name.starts_with(name.as_str()))
                    .max_by_key(String::len)
                    .map(|name| {
                        ResourceRef::new(&resource.namespace, ResourceKind::Deployment, name)
                    })
                    .ok_or_else(|| {
                        Error::Validation(format!("no owning deployment found for {}", resource))
                    })
            }
            _ => Err(Error::Input(format!(
                "cannot apply a fix to resource kind {}",
                resource.kind
            ))),
        }
    }

    /// Capture the pre-apply manifest used for rollback.
    pub async fn snapshot(&self, resource: &ResourceRef) -> Result<Value> {
        let target = self.target_deployment(resource).await?;
        let deployment = self
            .cluster
            .get_deployment(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| Error::ClusterApi(format!("{} not found for snapshot", target)))?;
        let mut manifest = serde_json::to_value(&deployment)?;
        strip_cluster_fields(&mut manifest);
        Ok(manifest)
    }

    /// Apply an approved proposal: manifests as strategic patches, then the
    /// recognized command forms.
    pub async fn apply(&self, resource: &ResourceRef, proposal: &FixProposal) -> Result<()> {
        let target = self.target_deployment(resource).await?;
        let result = self.apply_inner(&target, proposal).await;
        metrics::fix_applied(
            &proposal.kind.to_string(),
            &resource.namespace,
            result.is_ok(),
        );
        result
    }

    async fn apply_inner(&self, target: &ResourceRef, proposal: &FixProposal) -> Result<()> {
        for (name, text) in &proposal.manifests {
            let patch: Value = serde_yaml::from_str(text)?;
            debug!(manifest = %name, target = %target, "applying manifest patch");
            self.cluster
                .patch_deployment(&target.namespace, &target.name, patch)
                .await?;
        }
        for command in &proposal.commands {
            self.apply_command(target, command).await?;
        }
        info!(target = %target, kind = %proposal.kind, "fix applied");
        Ok(())
    }

    /// Interpret one proposal command into a cluster call. Unrecognized
    /// commands are skipped with a warning rather than executed blindly.
    async fn apply_command(&self, target: &ResourceRef, command: &str) -> Result<()> {
        let lowered = command.to_lowercase();
        if lowered.contains("rollout restart") {
            debug!(target = %target, "command maps to rollout restart");
            return self
                .cluster
                .restart_deployment(&target.namespace, &target.name)
                .await;
        }
        if let Some(replicas) = extract_flag(command, "--replicas=") {
            let replicas: i32 = replicas
                .parse()
                .map_err(|_| Error::Input(format!("bad replica count in '{}'", command)))?;
            debug!(target = %target, replicas, "command maps to scale");
            return self
                .cluster
                .scale_deployment(&target.namespace, &target.name, replicas)
                .await;
        }
        if let Some(image) = extract_image(command) {
            debug!(target = %target, image = %image, "command maps to image update");
            let container = self.primary_container(target).await?;
            let patch = serde_json::json!({
                "spec": {"template": {"spec": {"containers": [
                    {"name": container, "image": image}
                ]}}}
            });
            return self
                .cluster
                .patch_deployment(&target.namespace, &target.name, patch)
                .await;
        }
        warn!(command, "unrecognized proposal command, skipping");
        Ok(())
    }

    async fn primary_container(&self, target: &ResourceRef) -> Result<String> {
        let deployment = self
            .cluster
            .get_deployment(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| Error::ClusterApi(format!("{} not found", target)))?;
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| Error::Validation(format!("{} has no containers", target)))
    }

    /// Re-apply a pre-apply snapshot.
    pub async fn rollback(&self, resource: &ResourceRef, snapshot: &Value) -> Result<()> {
        let target = self.target_deployment(resource).await?;
        info!(target = %target, "rolling back to pre-apply snapshot");
        self.cluster
            .replace_deployment(&target.namespace, &target.name, snapshot.clone())
            .await
    }
}

fn extract_flag<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    let start = command.find(flag)? + flag.len();
    let rest = &command[start..];
    let value = rest.split_whitespace().next().unwrap_or("");
    (!value.is_empty()).then_some(value)
}

/// `kubectl set image deploy/x api=registry/img:tag` or `--image=img:tag`.
fn extract_image(command: &str) -> Option<String> {
    if let Some(image) = extract_flag(command, "--image=") {
        return Some(image.to_string());
    }
    if command.contains("set image") {
        return command
            .split_whitespace()
            .rev()
            .find(|token| token.contains('=') && !token.starts_with("--"))
            .and_then(|token| token.splitn(2, '=').nth(1))
            .map(String::from);
    }
    None
}
