//! Caller-side Retry
//!
//! The service never retries on its own. Callers that want to ride out an
//! unreachable server group or a timed-out round trip wrap the call in
//! [`retry_with_backoff`]; terminal errors are returned on the first attempt.

use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or the policy gives up
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff::future::retry(policy.backoff(), || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e: Error| {
                if e.is_retryable() {
                    debug!(kind = e.kind(), "retrying after transient error: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = retry_with_backoff(&fast(), move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::ServerGroupUnreachable {
                    group: "daos_server".into(),
                })
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<()> = retry_with_backoff(&fast(), move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::pool_not_found("44be6958-40f4-b6ed-a581-b461a4d4c570"))
        })
        .await;

        assert_matches!(result, Err(Error::PoolNotFound { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_elapsed() {
        let policy = RetryPolicy {
            max_elapsed: Duration::from_millis(20),
            ..fast()
        };
        let result: Result<()> = retry_with_backoff(&policy, || async {
            Err(Error::Timeout {
                operation: "probe".into(),
                after: Duration::from_millis(1),
            })
        })
        .await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }
}
