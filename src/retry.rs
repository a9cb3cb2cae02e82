//! Bounded retry executor.
//!
//! Wraps any [`Attempt`] and re-runs it until it succeeds or the attempt
//! budget is spent. Pacing between attempts is optional: adapters usually
//! leave `delay` unset because their own quota backoff already sleeps.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Default attempt budget for a single target fetch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// One retryable unit of work.
#[async_trait]
pub trait Attempt: Send {
    type Output: Send;
    type Error: fmt::Display + Send;

    async fn attempt(&mut self) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever. Only sensible when the operation bounds its
    /// own waiting (e.g. sleeps out a quota backoff before failing).
    pub max_attempts: Option<u32>,
    /// Fixed pause between a failure and the next attempt.
    pub delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run `operation` until it returns `Ok` or the budget is exhausted,
    /// in which case the last error is returned. A budget of zero still
    /// makes one attempt.
    pub async fn execute<A: Attempt>(
        &self,
        label: &str,
        operation: &mut A,
    ) -> Result<A::Output, A::Error> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(operation = label, attempt, "Attempt started");

            let err = match operation.attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            warn!(operation = label, attempt, "Attempt failed: {}", err);

            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    return Err(err);
                }
            }

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails `failures` times, then returns the call count.
    struct Flaky {
        failures: u32,
        calls: u32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self { failures, calls: 0 }
        }
    }

    #[async_trait]
    impl Attempt for Flaky {
        type Output = u32;
        type Error = String;

        async fn attempt(&mut self) -> Result<u32, String> {
            self.calls += 1;
            if self.calls <= self.failures {
                Err(format!("failure #{}", self.calls))
            } else {
                Ok(self.calls)
            }
        }
    }

    #[tokio::test]
    async fn test_success_after_k_failures() {
        let policy = RetryPolicy::bounded(5);
        let mut op = Flaky::new(3);

        let result = policy.execute("flaky", &mut op).await;
        assert_eq!(result, Ok(4));
        assert_eq!(op.calls, 4);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::bounded(3);
        let mut op = Flaky::new(10);

        let result = policy.execute("flaky", &mut op).await;
        assert_eq!(result, Err("failure #3".to_string()));
        assert_eq!(op.calls, 3);
    }

    #[tokio::test]
    async fn test_first_try_success_runs_once() {
        let mut op = Flaky::new(0);
        let result = RetryPolicy::default().execute("flaky", &mut op).await;
        assert_eq!(result, Ok(1));
        assert_eq!(op.calls, 1);
    }

    #[tokio::test]
    async fn test_zero_budget_still_attempts_once() {
        let mut op = Flaky::new(10);
        let result = RetryPolicy::bounded(0).execute("flaky", &mut op).await;
        assert!(result.is_err());
        assert_eq!(op.calls, 1);
    }

    #[tokio::test]
    async fn test_unbounded_keeps_going() {
        let mut op = Flaky::new(25);
        let result = RetryPolicy::unbounded().execute("flaky", &mut op).await;
        assert_eq!(result, Ok(26));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_attempts() {
        let policy = RetryPolicy::bounded(4).with_delay(Duration::from_secs(5));
        let mut op = Flaky::new(3);

        let start = tokio::time::Instant::now();
        let result = policy.execute("flaky", &mut op).await;
        assert_eq!(result, Ok(4));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(15) && waited < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_independent_calls_share_no_state() {
        let policy = RetryPolicy::bounded(2);

        let mut first = Flaky::new(1);
        assert_eq!(policy.execute("first", &mut first).await, Ok(2));

        let mut second = Flaky::new(1);
        assert_eq!(policy.execute("second", &mut second).await, Ok(2));
    }
}
