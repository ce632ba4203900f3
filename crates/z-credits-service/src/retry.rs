//! Bounded retry of units of work that lose a lock or write conflict.

use std::time::Duration;

use z_credits_core::{LedgerError, Result};

/// Exponential backoff policy for contended units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Cap on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

/// Run `unit_of_work` until it succeeds, fails for good, or runs out of attempts.
///
/// Only [`LedgerError::Concurrency`] is retried; store conflicts convert into
/// it through `?`. Every other error is returned immediately. Each attempt must
/// begin and finish its own transaction so no lock survives into the backoff.
///
/// # Errors
///
/// Returns `LedgerError::Concurrency { attempts }` once the policy is
/// exhausted, or the first non-retryable error.
pub async fn with_retry<T, F>(policy: &RetryPolicy, operation: &str, mut unit_of_work: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        match unit_of_work() {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Unit of work succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Unit of work failed after max retries"
                    );
                    return Err(LedgerError::Concurrency { attempts: attempt });
                }

                tracing::warn!(
                    operation,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Unit of work conflicted, retrying"
                );

                tokio::time::sleep(backoff).await;

                backoff = next_backoff(backoff, policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff with cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).min(cap)
}
