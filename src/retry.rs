//! Bounded exponential backoff and per-call timeouts for outbound integrations.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::IntegrationConfig;
use crate::errors::ServiceError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first call.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&IntegrationConfig> for RetryPolicy {
    fn from(config: &IntegrationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// An outbound call that did not succeed.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ServiceError,
}

impl From<RetryFailure> for ServiceError {
    fn from(failure: RetryFailure) -> Self {
        failure.error
    }
}

/// Runs `fut`, converting an elapsed deadline into [`ServiceError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, label: &str, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(format!(
            "{} did not answer within {}ms",
            label,
            limit.as_millis()
        ))),
    }
}

/// Calls `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. Each attempt is bounded by the policy's call timeout.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match with_timeout(policy.call_timeout, label, op()).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempts <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempts - 1);
                warn!(
                    integration = label,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "outbound call failed, retrying"
                );
                sleep(delay).await;
            }
            Err(error) => return Err(RetryFailure { attempts, error }),
        }
    }
}
