//! # Bounded Retry
//!
//! Exponential backoff used for transient failures of authentication calls and
//! part transfers. Only errors classified by [`AppError::is_retryable`] are
//! retried; everything else returns after the first attempt.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Why a retried operation stopped without succeeding.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: AppError,
    pub attempts: u32,
    /// True when the last error was transient and the attempt budget ran out.
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: false,
                    })
                }
                Err(error) if attempt >= max => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: true,
                    })
                }
                Err(error) => {
                    let delay = self.backoff_for(attempt);
                    tracing::debug!(attempt, ?delay, %error, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 700,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(700));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::default()
            .run(move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::Unavailable("503".into()))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_is_reported() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let failure = policy
            .run(|_| async { Err::<(), _>(AppError::Unavailable("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let failure = RetryPolicy::default()
            .run(move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::Unauthorized("no".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
        assert!(matches!(failure.error, AppError::Unauthorized(_)));
    }
}
