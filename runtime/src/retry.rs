//! Exponential backoff for transient failures.
//!
//! The dispatcher re-runs a handler while its error says the store was only
//! briefly unreachable; the worker does the same for its first database
//! connection. Permanent errors are returned without sleeping.
//!
//! # Example
//!
//! ```rust
//! use engagement_runtime::retry::{RetryPolicy, retry_transient};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let attempt = retry_transient(&policy, |_: &String| true, || async { Ok::<_, String>(7) }).await;
//! assert_eq!(attempt.result, Ok(7));
//! assert_eq!(attempt.attempts, 1);
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// How often and how patiently to retry.
///
/// Defaults: 2 retries, first delay 100 ms, doubling, capped at 5 s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Start from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: RetryPolicy {
                max_retries: DEFAULT_MAX_RETRIES,
                initial_delay: DEFAULT_INITIAL_DELAY,
                max_delay: DEFAULT_MAX_DELAY,
                multiplier: DEFAULT_MULTIPLIER,
            },
        }
    }

    /// Run once, never retry.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::builder().max_retries(0).build()
    }

    /// Wait before retry number `retry` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Cap for any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between waits.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Final result of a retried operation and how many times it ran.
#[derive(Debug, PartialEq, Eq)]
pub struct Attempted<T, E> {
    /// Success, or the error of the last attempt
    pub result: Result<T, E>,
    /// Times the operation ran, at least 1
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or the policy's retries are spent.
pub async fn retry_transient<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    is_transient: P,
    mut operation: F,
) -> Attempted<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Succeeded after retry");
                }
                return Attempted {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) => err,
        };

        let retries_used = attempts - 1;
        if !is_transient(&err) || retries_used >= policy.max_retries {
            return Attempted {
                result: Err(err),
                attempts,
            };
        }

        let delay = policy.backoff(retries_used);
        tracing::warn!(
            attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
