//! Error types and result handling for AEGIS

use thiserror::Error;

/// Result type alias for AEGIS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type, organized by failure kind rather than by source module
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("external tool failure: {0}")]
    ExternalTool(String),

    #[error("cluster API error: {0}")]
    ClusterApi(String),

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("security gate blocked: {0}")]
    SecurityBlock(String),

    #[error("health check failure: {0}")]
    HealthFailure(String),

    #[error("incident queue at capacity ({0} entries)")]
    QueueFull(usize),

    #[error("unsupported change key: {0}")]
    UnsupportedChange(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::ClusterApi(msg) => {
                // Transient API conditions; not-found and forbidden are final.
                let msg = msg.to_ascii_lowercase();
                msg.contains("conflict")
                    || msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
            }
            _ => false,
        }
    }

    /// Error category used as a metric label.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Input(_) => "input",
            Error::Timeout(_) => "timeout",
            Error::ExternalTool(_) => "external_tool",
            Error::ClusterApi(_) => "cluster_api",
            Error::Validation(_) => "validation",
            Error::SecurityBlock(_) => "security_block",
            Error::HealthFailure(_) => "health_failure",
            Error::QueueFull(_) => "queue_full",
            Error::UnsupportedChange(_) => "unsupported_change",
            Error::Cancelled(_) => "cancelled",
            Error::Serialization(_) => "serialization",
            Error::Yaml(_) => "yaml",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Timeout("llm call".into()).is_retryable());
        assert!(Error::ClusterApi("503 service unavailable".into()).is_retryable());
        assert!(!Error::ClusterApi("404 not found".into()).is_retryable());
        assert!(!Error::Input("bad ref".into()).is_retryable());
        assert!(!Error::SecurityBlock("critical CVE".into()).is_retryable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(Error::QueueFull(10).category(), "queue_full");
        assert_eq!(Error::UnsupportedChange("foo".into()).category(), "unsupported_change");
    }
}
