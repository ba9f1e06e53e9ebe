//! Bounded retries for registry-facing calls.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times a registry call is attempted and how long to wait in between.
///
/// The wait before attempt `n + 1` is `delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Base delay between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt)
    }
}

#[derive(Debug)]
pub(crate) enum RetryError {
    /// The token was cancelled before an attempt succeeded.
    Cancelled,
    /// Every attempt failed; carries the last error.
    Exhausted(anyhow::Error),
}

/// Run `operation` until it succeeds, the attempts of `policy` are exhausted or
/// `shutdown` is cancelled.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    method: &str,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted(err));
        }

        let backoff = policy.backoff(attempt);
        let error = format!("{err:#}");
        tracing::debug!(
            method,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            %error,
            "retrying after backoff"
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
