//! Bounded retry with exponential backoff

use crate::error::{Error, Result};
use crate::utils::exponential_backoff;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Shadow re-verification schedule driven by the operator.
pub const SHADOW_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(90),
];

/// Retry settings for transient failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Run `op` until it succeeds, the error is not retryable, or attempts run
/// out. Only errors whose `is_retryable()` is true are retried.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt + 1 < config.max_attempts => {
                let delay = exponential_backoff(
                    attempt,
                    config.initial_delay_ms,
                    config.max_delay_ms,
                    config.multiplier,
                );
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay,
                    error = %err,
                    "transient failure, retrying"
                );
                sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Convenience wrapper classifying cluster API failures.
pub fn cluster_error(context: &str, detail: impl std::fmt::Display) -> Error {
    Error::ClusterApi(format!("{}: {}", context, detail))
}
