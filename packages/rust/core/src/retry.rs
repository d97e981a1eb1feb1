//! Bounded automatic retry around a single external call.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use worldforge_shared::{PipelineConfig, Result, WorldforgeError};

/// How many times a call is attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// The wait before attempt `n + 1` is `n * base_delay`.
    pub base_delay: Duration,
    /// Upper bound on a single attempt. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            call_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            call_timeout: Some(config.call_timeout()),
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// The last error of a call that did not succeed, with the attempts spent on it.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: WorldforgeError,
}

impl RetryExhausted {
    pub fn into_upload_error(self) -> WorldforgeError {
        WorldforgeError::Upload {
            attempts: self.attempts,
            source: Box::new(self.last),
        }
    }

    pub fn into_extraction_error(self) -> WorldforgeError {
        WorldforgeError::Extraction {
            attempts: self.attempts,
            source: Box::new(self.last),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Every attempt is built fresh from `op` with the same captured input. Errors
/// for which [`WorldforgeError::is_retryable`] is false end the loop at once.
/// Backoff is linear with no jitter.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> std::result::Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match policy.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(WorldforgeError::Timeout {
                    operation: label.to_string(),
                    secs: limit.as_secs(),
                }),
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }
}
