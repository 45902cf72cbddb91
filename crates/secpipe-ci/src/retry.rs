//! Flat bounded retry.
//!
//! The operation is attempted up to `max_attempts` times with a fixed delay
//! between attempts. No backoff, no jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use secpipe_core::obs;
use secpipe_core::RetryConfig;

/// Retry bound and delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.delay(),
        }
    }
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Invoke `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. The error of the last attempt is
/// returned when every attempt fails. A policy with `max_attempts == 0` still
/// makes one attempt.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if attempt < max_attempts => {
                obs::emit_retry_scheduled(attempt, max_attempts, policy.delay.as_secs(), &err);
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}
