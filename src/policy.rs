//! Retry of backend calls that fail with transient errors.
//!
//! Only backend conditions (deadlocks, dropped connections, pool timeouts)
//! go through here. Application failures are handled by the retry table in
//! [`engine::retry`](crate::engine::retry).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::TransientRetryOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TransientRetry {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self::from_options(&TransientRetryOptions::default())
    }
}

impl TransientRetry {
    pub fn from_options(options: &TransientRetryOptions) -> Self {
        Self {
            max_attempts: options.max_attempts.max(1),
            base_delay: Duration::from_millis(options.base_delay_ms),
            max_delay: Duration::from_millis(options.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the sleep before attempt `attempt + 1`.
    /// base * 2^(attempt - 1), capped at max_delay.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Full jitter: uniform in `[0, ceiling]`.
    fn jittered(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Called after attempt `attempt` of `operation` failed with `error`.
    /// Sleeps and returns `true` when the error is transient and attempts
    /// remain, so the caller can try again.
    ///
    /// For loops that can't be expressed as a closure, e.g. one that lends
    /// a `&mut` handle to every attempt.
    pub async fn backoff(&self, operation: &str, attempt: u32, error: &Error) -> bool {
        if !error.is_transient() || attempt >= self.max_attempts {
            return false;
        }
        let delay = self.jittered(attempt);
        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient backend error, retrying"
        );
        tokio::time::sleep(delay).await;
        true
    }

    /// Run `op`, re-running it while it fails with a transient error and
    /// attempts remain. The last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !self.backoff(operation, attempt, &error).await {
                return Err(error);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> TransientRetry {
        TransientRetry::from_options(&TransientRetryOptions {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        })
    }

    fn transient() -> Error {
        Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = TransientRetry::from_options(&TransientRetryOptions {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        });
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_stops_at_the_last_attempt() {
        let policy = fast();
        assert!(policy.backoff("test", 1, &transient()).await);
        assert!(policy.backoff("test", 2, &transient()).await);
        assert!(!policy.backoff("test", 3, &transient()).await);
        assert!(!policy.backoff("test", 1, &Error::Config("nope".into())).await);
        assert!(!TransientRetry::none().backoff("test", 1, &transient()).await);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Config("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
