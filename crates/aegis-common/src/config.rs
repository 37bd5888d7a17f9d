//! Configuration for the AEGIS operator and its collaborators
//!
//! Defaults cover a workable in-cluster deployment; every recognized option
//! can be overridden from the environment (`AEGIS_<SECTION>_<KEY>`) or a TOML
//! file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub cluster: ClusterConfig,
    pub queue: QueueConfig,
    pub shadow: ShadowConfig,
    pub security: SecurityConfig,
    pub rollback: RollbackConfig,
    pub operator: OperatorConfig,
}

/// Language-model backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/chat".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            timeout_seconds: 60,
            max_retries: 1,
            temperature: 0.1,
        }
    }
}

/// Cluster access and diagnostic tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub in_cluster: bool,
    pub kubeconfig_path: Option<PathBuf>,
    pub context: Option<String>,
    pub namespace: String,
    pub api_timeout_seconds: u64,
    /// External diagnostic executable; absent binary degrades to mock mode.
    pub diagnostic_tool: String,
    pub diagnostic_mock: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            in_cluster: false,
            kubeconfig_path: None,
            context: None,
            namespace: "default".to_string(),
            api_timeout_seconds: 30,
            diagnostic_tool: "k8sgpt".to_string(),
            diagnostic_mock: false,
        }
    }
}

/// Incident queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub merge_window_seconds: u64,
    /// Namespaces treated as production for lock and approval decisions.
    pub production_namespaces: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            merge_window_seconds: 300,
            production_namespaces: vec!["production".to_string(), "prod".to_string()],
        }
    }
}

/// Shadow environment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Shadow backing runtime; only `namespace` is currently implemented.
    pub runtime: String,
    pub namespace_prefix: String,
    pub auto_cleanup: bool,
    pub cleanup_timeout_seconds: u64,
    pub verification_timeout_seconds: u64,
    pub readiness_timeout_seconds: u64,
    pub cpu_request: String,
    pub memory_request: String,
    pub max_concurrent_shadows: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            runtime: "namespace".to_string(),
            namespace_prefix: "aegis-shadow".to_string(),
            auto_cleanup: true,
            cleanup_timeout_seconds: 60,
            verification_timeout_seconds: 600,
            readiness_timeout_seconds: 120,
            cpu_request: "500m".to_string(),
            memory_request: "512Mi".to_string(),
            max_concurrent_shadows: 3,
        }
    }
}

/// Security gate chain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub image_scan_enabled: bool,
    pub image_scan_tool: String,
    /// Comma-separated severity set passed to the image scanner.
    pub image_scan_severity: String,
    pub runtime_alerts_enabled: bool,
    pub runtime_alerts_severity: String,
    pub runtime_alerts_source_namespace: String,
    pub runtime_alerts_selector: String,
    pub web_scan_enabled: bool,
    pub web_scan_image: String,
    pub web_scan_target: Option<String>,
    pub manifest_scan_enabled: bool,
    pub manifest_scan_tool: String,
    pub manifest_scan_block_on_critical: bool,
    pub scanner_timeout_seconds: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            image_scan_enabled: true,
            image_scan_tool: "trivy".to_string(),
            image_scan_severity: "CRITICAL,HIGH".to_string(),
            runtime_alerts_enabled: true,
            runtime_alerts_severity: "WARNING".to_string(),
            runtime_alerts_source_namespace: "falco".to_string(),
            runtime_alerts_selector: "app.kubernetes.io/name=falco".to_string(),
            web_scan_enabled: false,
            web_scan_image: "ghcr.io/zaproxy/zaproxy:stable".to_string(),
            web_scan_target: None,
            manifest_scan_enabled: true,
            manifest_scan_tool: "kubesec".to_string(),
            manifest_scan_block_on_critical: true,
            scanner_timeout_seconds: 300,
        }
    }
}

/// Post-apply rollback watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub rollback_enabled: bool,
    pub rollback_window_seconds: u64,
    pub poll_interval_seconds: u64,
    /// Multiplier over the pre-apply baseline error rate.
    pub rollback_error_rate_threshold: f64,
    pub restart_count_threshold: i32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            rollback_enabled: true,
            rollback_window_seconds: 300,
            poll_interval_seconds: 30,
            rollback_error_rate_threshold: 1.2,
            restart_count_threshold: 5,
        }
    }
}

/// How apply approval is decided when a proposal is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Every apply requires an approver.
    Always,
    /// Only production-namespace applies require an approver.
    ProductionOnly,
    /// Risk-free, non-production proposals are granted automatically.
    AutoWhenSafe,
}

/// Processor daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub workers: usize,
    pub dequeue_timeout_seconds: u64,
    pub watch_interval_seconds: u64,
    pub approval_policy: ApprovalPolicy,
    pub approval_timeout_seconds: u64,
    pub metrics_listen: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dequeue_timeout_seconds: 30,
            watch_interval_seconds: 15,
            approval_policy: ApprovalPolicy::ProductionOnly,
            approval_timeout_seconds: 300,
            metrics_listen: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Input(format!("cannot read config {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| crate::Error::Input(format!("cannot parse config {}: {}", path.display(), e)))
    }

    /// Overlay `AEGIS_*` environment variables onto this configuration.
    pub fn overlay_env(mut self) -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.parse().ok())
        }

        if let Some(v) = var("AEGIS_LLM_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Some(v) = var("AEGIS_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("AEGIS_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = parse("AEGIS_LLM_TIMEOUT") {
            self.llm.timeout_seconds = v;
        }
        if let Some(v) = parse("AEGIS_LLM_MAX_RETRIES") {
            self.llm.max_retries = v;
        }
        if let Some(v) = parse("AEGIS_LLM_TEMPERATURE") {
            self.llm.temperature = v;
        }

        if let Some(v) = parse("AEGIS_CLUSTER_IN_CLUSTER") {
            self.cluster.in_cluster = v;
        }
        if let Some(v) = var("AEGIS_CLUSTER_KUBECONFIG") {
            self.cluster.kubeconfig_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("AEGIS_CLUSTER_CONTEXT") {
            self.cluster.context = Some(v);
        }
        if let Some(v) = var("AEGIS_CLUSTER_NAMESPACE") {
            self.cluster.namespace = v;
        }
        if let Some(v) = parse("AEGIS_CLUSTER_API_TIMEOUT") {
            self.cluster.api_timeout_seconds = v;
        }
        if let Some(v) = var("AEGIS_DIAGNOSTIC_TOOL") {
            self.cluster.diagnostic_tool = v;
        }
        if let Some(v) = parse("AEGIS_DIAGNOSTIC_MOCK") {
            self.cluster.diagnostic_mock = v;
        }

        if let Some(v) = parse("AEGIS_QUEUE_CAPACITY") {
            self.queue.capacity = v;
        }
        if let Some(v) = parse("AEGIS_QUEUE_MERGE_WINDOW") {
            self.queue.merge_window_seconds = v;
        }
        if let Some(v) = var("AEGIS_QUEUE_PRODUCTION_NAMESPACES") {
            self.queue.production_namespaces =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Some(v) = var("AEGIS_SHADOW_RUNTIME") {
            self.shadow.runtime = v;
        }
        if let Some(v) = var("AEGIS_SHADOW_NAMESPACE_PREFIX") {
            self.shadow.namespace_prefix = v;
        }
        if let Some(v) = parse("AEGIS_SHADOW_AUTO_CLEANUP") {
            self.shadow.auto_cleanup = v;
        }
        if let Some(v) = parse("AEGIS_SHADOW_CLEANUP_TIMEOUT") {
            self.shadow.cleanup_timeout_seconds = v;
        }
        if let Some(v) = parse("AEGIS_SHADOW_VERIFICATION_TIMEOUT") {
            self.shadow.verification_timeout_seconds = v;
        }
        if let Some(v) = var("AEGIS_SHADOW_CPU_REQUEST") {
            self.shadow.cpu_request = v;
        }
        if let Some(v) = var("AEGIS_SHADOW_MEMORY_REQUEST") {
            self.shadow.memory_request = v;
        }
        if let Some(v) = parse("AEGIS_SHADOW_MAX_CONCURRENT") {
            self.shadow.max_concurrent_shadows = v;
        }

        if let Some(v) = parse("AEGIS_SECURITY_IMAGE_SCAN_ENABLED") {
            self.security.image_scan_enabled = v;
        }
        if let Some(v) = var("AEGIS_SECURITY_IMAGE_SCAN_SEVERITY") {
            self.security.image_scan_severity = v;
        }
        if let Some(v) = parse("AEGIS_SECURITY_RUNTIME_ALERTS_ENABLED") {
            self.security.runtime_alerts_enabled = v;
        }
        if let Some(v) = var("AEGIS_SECURITY_RUNTIME_ALERTS_SEVERITY") {
            self.security.runtime_alerts_severity = v;
        }
        if let Some(v) = var("AEGIS_SECURITY_RUNTIME_ALERTS_NAMESPACE") {
            self.security.runtime_alerts_source_namespace = v;
        }
        if let Some(v) = var("AEGIS_SECURITY_RUNTIME_ALERTS_SELECTOR") {
            self.security.runtime_alerts_selector = v;
        }
        if let Some(v) = parse("AEGIS_SECURITY_WEB_SCAN_ENABLED") {
            self.security.web_scan_enabled = v;
        }
        if let Some(v) = var("AEGIS_SECURITY_WEB_SCAN_TARGET") {
            self.security.web_scan_target = Some(v);
        }
        if let Some(v) = parse("AEGIS_SECURITY_MANIFEST_SCAN_ENABLED") {
            self.security.manifest_scan_enabled = v;
        }
        if let Some(v) = parse("AEGIS_SECURITY_MANIFEST_SCAN_BLOCK_ON_CRITICAL") {
            self.security.manifest_scan_block_on_critical = v;
        }

        if let Some(v) = parse("AEGIS_ROLLBACK_ENABLED") {
            self.rollback.rollback_enabled = v;
        }
        if let Some(v) = parse("AEGIS_ROLLBACK_WINDOW") {
            self.rollback.rollback_window_seconds = v;
        }
        if let Some(v) = parse("AEGIS_ROLLBACK_ERROR_RATE_THRESHOLD") {
            self.rollback.rollback_error_rate_threshold = v;
        }

        if let Some(v) = parse("AEGIS_OPERATOR_WORKERS") {
            self.operator.workers = v;
        }
        if let Some(v) = var("AEGIS_OPERATOR_APPROVAL_POLICY") {
            self.operator.approval_policy = match v.as_str() {
                "always" => ApprovalPolicy::Always,
                "auto-when-safe" => ApprovalPolicy::AutoWhenSafe,
                _ => ApprovalPolicy::ProductionOnly,
            };
        }
        if let Some(v) = var("AEGIS_OPERATOR_METRICS_LISTEN") {
            self.operator.metrics_listen = Some(v);
        }

        self
    }

    /// Copy with secret values replaced, for `config show`.
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        if out.llm.api_key.is_some() {
            out.llm.api_key = Some("***".to_string());
        }
        out
    }

    pub fn is_production_namespace(&self, namespace: &str) -> bool {
        self.queue
            .production_namespaces
            .iter()
            .any(|ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.llm.timeout_seconds, 60);
        assert_eq!(config.queue.merge_window_seconds, 300);
        assert_eq!(config.shadow.max_concurrent_shadows, 3);
        assert_eq!(config.rollback.rollback_error_rate_threshold, 1.2);
        assert_eq!(config.operator.approval_policy, ApprovalPolicy::ProductionOnly);
        assert!(config.is_production_namespace("production"));
        assert!(!config.is_production_namespace("staging"));
    }

    #[test]
    fn masking_hides_api_key() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-secret".to_string());
        let masked = config.masked();
        assert_eq!(masked.llm.api_key.as_deref(), Some("***"));
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-secret"));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.shadow.namespace_prefix, config.shadow.namespace_prefix);
        assert_eq!(parsed.security.image_scan_severity, config.security.image_scan_severity);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str("[llm]\nmodel = \"mistral\"\n").unwrap();
        assert_eq!(parsed.llm.model, "mistral");
        assert_eq!(parsed.llm.timeout_seconds, 60);
        assert_eq!(parsed.queue.capacity, 512);
    }
}
