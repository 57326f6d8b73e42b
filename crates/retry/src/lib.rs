//! Bounded retry with fixed or exponential backoff for external interactions.
//!
//! Every probe check, destructive statement, and tool invocation in the
//! cluster bootstrap is wrapped in a [`RetryPolicy`] with an
//! operation-specific budget. Slow cold-starts and connection flakiness are
//! expected, not exceptional.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Exhausted;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded backoff schedule applied around an external interaction.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub interval: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    pub ceiling: Duration,
}

impl RetryPolicy {
    /// A fixed-interval schedule.
    #[must_use]
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff_multiplier: 1.0,
            ceiling: interval,
        }
    }

    /// An exponential schedule with a delay ceiling.
    #[must_use]
    pub const fn exponential(
        max_attempts: u32,
        interval: Duration,
        backoff_multiplier: f64,
        ceiling: Duration,
    ) -> Self {
        Self {
            max_attempts,
            interval,
            backoff_multiplier,
            ceiling,
        }
    }

    /// The delay to sleep after the given 1-based attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.interval.mul_f64(self.backoff_multiplier.powi(exponent));

        delay.min(self.ceiling)
    }
}

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// The closure receives the 1-based attempt number. Between attempts the
/// task sleeps cooperatively according to the policy's schedule. On
/// exhaustion the final failure is returned inside [`Exhausted`].
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the last attempt's error once
/// `max_attempts` attempts have failed.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, Exhausted<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= policy.max_attempts => {
                return Err(Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                debug!("attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let value = retry(&policy, |_| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("not yet")
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result: Result<(), _> = retry(&policy, |attempt| async move {
            Err(format!("failure {attempt}"))
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last, "failure 3");
    }

    #[tokio::test]
    async fn test_first_success_makes_no_further_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        retry::<_, &str, _, _>(&policy, |_| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delay_respects_ceiling() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(8), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(30, Duration::from_secs(5));

        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(29), Duration::from_secs(5));
    }
}
