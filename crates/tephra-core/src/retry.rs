//! Bounded exponential-backoff retry for transient upstream failures.
//!
//! Index-store calls are wrapped in this helper so that rate-limit-class
//! failures get a small, bounded number of retries. Non-transient failures
//! are returned immediately; retrying a malformed-input or conflict error
//! would only waste the invocation's compute budget.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Retry policy: attempt count and backoff bounds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles each retry.
    pub base_backoff: Duration,
    /// Upper bound on a single backoff sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Runs `op`, retrying only rate-limited failures per the policy.
///
/// `op_name` is used for log context only.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-transient error immediately.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.base_backoff;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limited() && attempt < attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns on final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retries_rate_limited_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(quick_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::RateLimited {
                        message: "slow down".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should eventually succeed"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("object missing".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::RateLimited {
                    message: "still busy".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
