//! Retry handler for node execution.
//!
//! Stateless: all logic lives in associated functions that take the node's
//! `RetryPolicy` as a parameter. Only whitelisted error kinds are retried
//! (timeouts and system errors by default); opaque step failures are not
//! unless the policy lists `step_runtime` explicitly.

use std::time::Duration;

use flowgate_types::error::ErrorKind;
use flowgate_types::workflow::RetryPolicy;

/// Stateless retry handler.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether a retry should be attempted.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, kind: ErrorKind) -> bool {
        attempt < policy.max_attempts && policy.retry_on.contains(&kind)
    }

    /// Backoff to wait after the failed `attempt` before the next one.
    ///
    /// `initial_backoff_ms * multiplier^(attempt-1)`, capped at `max_backoff_ms`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = policy.initial_backoff_ms as f64 * policy.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(policy.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}
