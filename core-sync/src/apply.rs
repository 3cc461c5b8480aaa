//! Adapter call execution with per-call timeouts and bounded retry
//!
//! Every adapter call is bounded by `call_timeout`; a call that exceeds it is
//! reported as [`BridgeError::Timeout`]. Apply calls are retried while the
//! adapter tags the failure as retryable and attempts remain, doubling the
//! delay between attempts up to `max_backoff`. A rate-limited call waits at
//! least as long as the remote asked for.

use bridge_traits::BridgeError;
use core_runtime::config::ReconcileConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Retry parameters for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            call_timeout: config.call_timeout,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map(|d| d.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    /// Delay before retry number `retry` when the target asked for `requested`
    ///
    /// A requested delay is honoured up to `call_timeout`, so one rate-limited
    /// entity cannot hold its apply slot indefinitely.
    pub fn delay_for(&self, retry: u32, requested: Option<Duration>) -> Duration {
        let requested = requested.unwrap_or_default().min(self.call_timeout);
        self.backoff_for(retry).max(requested)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

/// Final failure of a retried call
#[derive(Debug)]
pub struct ApplyFailure {
    pub error: BridgeError,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl ApplyFailure {
    pub fn is_transient(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Run one adapter call bounded by `limit`
///
/// # Errors
///
/// Returns the adapter's error, or `BridgeError::Timeout` if the call did not
/// finish in time.
pub async fn call_with_timeout<T, F>(limit: Duration, call: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout(limit.as_millis() as u64)),
    }
}

/// Run an adapter call, retrying retryable failures with backoff
///
/// `make_call` is invoked once per attempt.
///
/// # Errors
///
/// Returns an [`ApplyFailure`] carrying the last error once the error is not
/// retryable or the attempts are exhausted.
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, mut make_call: F) -> Result<(T, u32), ApplyFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(attempt, max_attempts = policy.max_attempts, "Executing adapter call");

        let error = match call_with_timeout(policy.call_timeout, make_call()).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= policy.max_attempts {
            return Err(ApplyFailure {
                error,
                attempts: attempt,
            });
        }

        let delay = policy.delay_for(attempt, error.retry_after_ms().map(Duration::from_millis));
        warn!(
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Adapter call failed, retrying"
        );
        sleep(delay).await;
    }
}
