//! Bounded exponential-backoff retry for external calls
//!
//! Retry is owned by the engine: [`MailingListClient`](crate::traits::MailingListClient)
//! implementations make exactly one call per invocation and report failure,
//! and the engine wraps every call in [`execute_with_retry`].
//!
//! ## Policy
//!
//! - At most `max_attempts` attempts (a hard cap, not a deadline)
//! - Only [`Error::is_retryable`] failures (429 and 5xx) are retried
//! - Backoff starts at `base_delay` and doubles after each retryable failure
//! - The last error is returned unchanged once attempts run out or a fatal
//!   error occurs

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry policy for a single external call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` below 1 is treated as 1
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the `retry`-th retryable failure (0-indexed): `base * 2^retry`
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

/// Run `operation` under `policy`
///
/// `label` names the call and `subject` identifies the user; both are used
/// for logging only.
///
/// # Returns
///
/// - `Ok(T)`: The first successful result
/// - `Err(Error)`: The fatal error, or the last retryable error once attempts are exhausted
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    subject: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        info!(label, subject, attempt, "Attempting external call");

        let err: Error = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retryable = err.is_retryable();
        warn!(
            label,
            subject,
            attempt,
            status = ?err.status(),
            retryable,
            "External call failed: {}",
            err
        );

        if !retryable || attempt >= max_attempts {
            error!(
                label,
                subject,
                attempt,
                status = ?err.status(),
                "Giving up after {} attempt(s){}",
                attempt,
                if retryable { "" } else { " (non-retryable error)" }
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        info!(label, subject, "Retrying in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}
