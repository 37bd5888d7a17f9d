//! Diagnostic collector
//!
//! Builds a `FaultContext` for an incident by running the external
//! diagnostic tool and augmenting the result with the log tail, recent
//! events, and the live manifest. Collection never fails: missing tools and
//! timeouts degrade to a partial context with `errors` populated so the
//! analysis stages can still reason over what is available.

use crate::ops::{self, ClusterOps};
use aegis_common::config::ClusterConfig;
use aegis_common::{
    DiagnosticFinding, Error, FaultContext, ResourceKind, ResourceRef, Result,
};
use chrono::Utc;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const LOG_TAIL_LINES: i64 = 50;

/// Wraps the external diagnostic tool plus raw resource queries
pub struct DiagnosticCollector {
    cluster: Arc<dyn ClusterOps>,
    tool: String,
    mock_mode: bool,
    timeout: Duration,
    lm_backend: String,
}

impl DiagnosticCollector {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        config: &ClusterConfig,
        lm_backend: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            tool: config.diagnostic_tool.clone(),
            mock_mode: config.diagnostic_mock,
            timeout: Duration::from_secs(config.api_timeout_seconds),
            lm_backend: lm_backend.into(),
        }
    }

    /// Build the fault context for a resource. Always returns a context;
    /// failures surface through `errors`.
    pub async fn collect(&self, resource: &ResourceRef) -> FaultContext {
        let mut context = FaultContext::empty(resource.clone());

        if self.mock_mode {
            context.findings = self.synthesize_findings(resource).await;
        } else {
            match self.run_tool(resource).await {
                Ok(findings) => context.findings = findings,
                Err(Error::ExternalTool(reason)) => {
                    warn!(resource = %resource, reason, "diagnostic tool unavailable");
                    context.errors.push("diagnostic-unavailable".to_string());
                }
                Err(Error::Timeout(reason)) => {
                    warn!(resource = %resource, reason, "diagnostic tool timed out");
                    context.errors.push("diagnostic-timeout".to_string());
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "diagnostic run failed");
                    context.errors.push(format!("diagnostic-error: {}", e));
                }
            }
        }

        self.augment(&mut context).await;
        context.collected_at = Utc::now();
        context
    }

    async fn run_tool(&self, resource: &ResourceRef) -> Result<Vec<DiagnosticFinding>> {
        let mut command = Command::new(&self.tool);
        command
            .arg("analyze")
            .arg(format!("--filter={}", resource.kind))
            .arg(format!("--namespace={}", resource.namespace))
            .arg("--output=json")
            .arg("--explain")
            .arg(format!("--backend={}", self.lm_backend))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(tool = %self.tool, resource = %resource, "running diagnostic tool");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout(format!("diagnostic tool exceeded {:?}", self.timeout)))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ExternalTool(format!("diagnostic tool '{}' not found", self.tool))
                } else {
                    Error::ExternalTool(format!("diagnostic tool spawn failed: {}", e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalTool(format!(
                "diagnostic tool exited with {}: {}",
                output.status, stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_tool_output(&stdout, resource)
    }

    /// Deterministic findings for offline demos, derived from live resource
    /// state where available.
    async fn synthesize_findings(&self, resource: &ResourceRef) -> Vec<DiagnosticFinding> {
        let mut errors = Vec::new();
        match resource.kind {
            ResourceKind::Pod => {
                if let Ok(Some(pod)) = self.cluster.get_pod(&resource.namespace, &resource.name).await {
                    if ops::pod_oom_killed(&pod) {
                        errors.push("Container OOMKilled".to_string());
                    }
                    if let Some(reason) = ops::pod_waiting_reason(&pod) {
                        errors.push(format!("Container waiting: {}", reason));
                    }
                    let restarts = ops::pod_restart_count(&pod);
                    if restarts > 3 {
                        errors.push(format!("{} container restarts observed", restarts));
                    }
                }
            }
            ResourceKind::Deployment => {
                if let Ok(Some(deployment)) = self
                    .cluster
                    .get_deployment(&resource.namespace, &resource.name)
                    .await
                {
                    let (ready, desired) = ops::deployment_replicas(&deployment);
                    if ready < desired {
                        errors.push(format!("Deployment has {}/{} ready replicas", ready, desired));
                    }
                }
            }
            _ => {}
        }
        if errors.is_empty() {
            errors.push("Resource reported unhealthy by watcher".to_string());
        }
        vec![DiagnosticFinding {
            kind: resource.kind.to_string(),
            name: resource.name.clone(),
            namespace: resource.namespace.clone(),
            errors,
            parent: None,
        }]
    }

    async fn augment(&self, context: &mut FaultContext) {
        let resource = context.resource.clone();

        match self.fetch_manifest(&resource).await {
            Ok(manifest) => context.manifest = manifest,
            Err(e) => context.errors.push(format!("manifest-unavailable: {}", e)),
        }

        match self.fetch_log_tail(&resource).await {
            Ok(lines) => context.log_tail = lines,
            Err(e) => context.errors.push(format!("logs-unavailable: {}", e)),
        }

        match self
            .cluster
            .recent_events(&resource.namespace, Some(&resource.name))
            .await
        {
            Ok(events) => context.events = events,
            Err(e) => context.errors.push(format!("events-unavailable: {}", e)),
        }
    }

    async fn fetch_manifest(&self, resource: &ResourceRef) -> Result<Option<String>> {
        let manifest = match resource.kind {
            ResourceKind::Deployment => self
                .cluster
                .get_deployment(&resource.namespace, &resource.name)
                .await?
                .map(|d| serde_yaml::to_string(&d))
                .transpose()?,
            ResourceKind::Pod => self
                .cluster
                .get_pod(&resource.namespace, &resource.name)
                .await?
                .map(|p| serde_yaml::to_string(&p))
                .transpose()?,
            _ => None,
        };
        Ok(manifest)
    }

    async fn fetch_log_tail(&self, resource: &ResourceRef) -> Result<Vec<String>> {
        let pod_name = match resource.kind {
            ResourceKind::Pod => Some(resource.name.clone()),
            ResourceKind::Deployment => {
                // First pod of the workload stands in for the deployment.
                self.cluster
                    .list_pods(&resource.namespace, None)
                    .await?
                    .into_iter()
                    .filter_map(|p| p.metadata.name)
                    .find(|name| name.starts_with(&resource.name))
            }
            _ => None,
        };
        let Some(pod_name) = pod_name else {
            return Ok(Vec::new());
        };
        let text = self
            .cluster
            .pod_logs(&resource.namespace, &pod_name, LOG_TAIL_LINES, None)
            .await?;
        Ok(text.lines().map(|l| l.to_string()).collect())
    }
}

/// Parse diagnostic tool stdout into findings.
///
/// Accepts both `errors: [string]` and the `error: [{Text}]` shape, and
/// names given as `namespace/name`.
pub fn parse_tool_output(stdout: &str, resource: &ResourceRef) -> Result<Vec<DiagnosticFinding>> {
    let value: Value = serde_json::from_str(stdout)
        .map_err(|e| Error::Validation(format!("diagnostic output is not JSON: {}", e)))?;
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut findings = Vec::new();
    for result in results {
        let kind = result
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let raw_name = result
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (namespace, name) = match raw_name.split_once('/') {
            Some((ns, n)) => (ns.to_string(), n.to_string()),
            None => (resource.namespace.clone(), raw_name.to_string()),
        };

        let mut errors = Vec::new();
        if let Some(list) = result.get("errors").and_then(Value::as_array) {
            errors.extend(list.iter().filter_map(Value::as_str).map(String::from));
        }
        if let Some(list) = result.get("error").and_then(Value::as_array) {
            for entry in list {
                if let Some(text) = entry.as_str() {
                    errors.push(text.to_string());
                } else if let Some(text) = entry.get("Text").and_then(Value::as_str) {
                    errors.push(text.to_string());
                }
            }
        }

        let parent = result
            .get("parentObject")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        findings.push(DiagnosticFinding {
            kind,
            name,
            namespace,
            errors,
            parent,
        });
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, PodFixture};

    fn resource() -> ResourceRef {
        ResourceRef::new("production", ResourceKind::Pod, "demo-api-7fbd")
    }

    #[test]
    fn parses_text_wrapped_errors() {
        let stdout = r#"{
            "status": "ProblemDetected",
            "results": [{
                "kind": "Pod",
                "name": "production/demo-api-7fbd",
                "error": [{"Text": "Container OOMKilled"}],
                "parentObject": "Deployment/demo-api"
            }]
        }"#;
        let findings = parse_tool_output(stdout, &resource()).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].namespace, "production");
        assert_eq!(findings[0].errors, vec!["Container OOMKilled"]);
        assert_eq!(findings[0].parent.as_deref(), Some("Deployment/demo-api"));
    }

    #[test]
    fn parses_plain_string_errors() {
        let stdout = r#"{"results": [{"kind": "Pod", "name": "web-0", "errors": ["ImagePullBackOff"]}]}"#;
        let findings = parse_tool_output(stdout, &resource()).unwrap();
        assert_eq!(findings[0].name, "web-0");
        assert_eq!(findings[0].namespace, "production");
        assert_eq!(findings[0].errors, vec!["ImagePullBackOff"]);
    }

    #[tokio::test]
    async fn missing_tool_degrades_to_partial_context() {
        let cluster = Arc::new(MockCluster::new());
        let config = ClusterConfig {
            diagnostic_tool: "aegis-test-no-such-binary".to_string(),
            ..Default::default()
        };
        let collector = DiagnosticCollector::new(cluster, &config, "llama3");
        let context = collector.collect(&resource()).await;
        assert_eq!(context.errors, vec!["diagnostic-unavailable"]);
        assert!(context.findings.is_empty());
    }

    #[tokio::test]
    async fn mock_mode_synthesizes_oom_findings() {
        let cluster = Arc::new(MockCluster::new());
        let mut fixture = PodFixture::running("demo-api-7fbd");
        fixture.ready = false;
        fixture.oom_killed = true;
        fixture.waiting_reason = Some("CrashLoopBackOff".to_string());
        cluster.add_pod("production", fixture);
        cluster.push_logs("production", &["OOM killed", "restarting"]);

        let config = ClusterConfig {
            diagnostic_mock: true,
            ..Default::default()
        };
        let collector = DiagnosticCollector::new(cluster, &config, "llama3");
        let context = collector.collect(&resource()).await;
        assert!(context
            .findings[0]
            .errors
            .iter()
            .any(|e| e.contains("OOMKilled")));
        assert!(context.errors.is_empty());
        assert_eq!(context.log_tail.len(), 2);
        assert!(context.manifest.is_some());
    }
}
