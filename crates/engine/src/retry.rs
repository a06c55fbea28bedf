//! Retry wrapper applied around a single task invocation.
//!
//! The policy is data (attempt budget, base delay, multiplier, ceiling); the
//! wrapper is a plain async function so it can decorate any attempt closure.
//! Back-off waits are suspension points: they honour cancellation, and a
//! run paused during the wait holds the next attempt until it is resumed.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tasks::TaskError;
use tracing::warn;

use crate::signal::RunSignal;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded attempts with exponentially growing delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            multiplier,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

// ---------------------------------------------------------------------------
// Wrapper
// ---------------------------------------------------------------------------

/// Result of running an operation under a retry policy.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// The last error, after the budget ran out or a non-retryable error.
    Failed { error: TaskError, attempts: u32 },
    /// Cancellation observed during a back-off wait.
    Cancelled { attempts: u32 },
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or the attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    signal: &RunSignal,
    label: &str,
    is_retryable: R,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
    R: Fn(&TaskError) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1u32;

    loop {
        match op(attempt).await {
            Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },

            Err(error) if !is_retryable(&error) || attempt >= max_attempts => {
                return RetryOutcome::Failed { error, attempts: attempt };
            }

            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    task_id = label,
                    attempt,
                    max_attempts,
                    ?delay,
                    "retryable error, backing off: {error}"
                );

                if signal.sleep(delay).await.is_err() || signal.checkpoint().await.is_err() {
                    return RetryOutcome::Cancelled { attempts: attempt };
                }
                attempt += 1;
            }
        }
    }
}
