//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

const LOGGER: Logger = Logger::new("resilience");

/// Configuration for retry behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Backoff multiplier applied per attempt
    pub multiplier: f64,

    /// Jitter fraction; each delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failure of attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let scaled = if self.jitter > 0.0 {
            let factor = 1.0 - self.jitter + rand::random::<f64>() * 2.0 * self.jitter;
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Run `op`, retrying errors whose recommended recovery is RETRY
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(|err| err.is_retryable(), op).await
    }

    /// Run `op`, retrying errors that satisfy `should_retry`.
    ///
    /// After exhaustion the last error is surfaced wrapped as
    /// `RETRY_EXHAUSTED`, with the attempt count in its technical details.
    /// Non-retryable errors propagate unchanged on first occurrence.
    pub async fn run_if<T, P, F, Fut>(&self, mut should_retry: P, mut op: F) -> Result<T>
    where
        P: FnMut(&CoreError) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        LOGGER.info(
                            "operation succeeded after retries",
                            &[("attempt", json!(attempt))],
                        );
                    }
                    return Ok(value);
                }
                Err(err) if attempt < max_attempts && should_retry(&err) => {
                    let delay = self.delay_for(attempt);
                    LOGGER.warn(
                        "attempt failed, backing off",
                        &[
                            ("attempt", json!(attempt)),
                            ("delay_ms", json!(delay.as_millis() as u64)),
                            ("error", json!(err.to_string())),
                        ],
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if !should_retry(&err) => return Err(err),
                Err(err) => {
                    let kind = err.kind;
                    let message =
                        format!("operation failed after {max_attempts} attempts: {}", err.message);
                    return Err(CoreError::new(kind, message)
                        .with_code("RETRY_EXHAUSTED")
                        .with_detail("attempts", max_attempts)
                        .with_source(err));
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        // Capped at max_delay
        assert_eq!(policy.delay_for(10), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            initial_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(CoreError::network("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::network("still down")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.code, "RETRY_EXHAUSTED");
        assert_eq!(err.kind, crate::errors::ErrorKind::Network);
        assert_eq!(err.details.get("attempts"), Some(&serde_json::json!(3)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::validation("bad input")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code, "VALIDATION_ERROR");
    }
}
