//! Bounded retry and per-call deadlines.
//!
//! [`retry`] is the one retry loop in the workspace. Health verification,
//! secondary-region replication and retention deletion all go through it,
//! each attempt optionally bounded by its own timeout.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Attempt budget and pacing for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Creates a policy with a fixed attempt budget and inter-attempt delay.
    ///
    /// A zero budget is treated as a single attempt.
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            interval,
            attempt_timeout: None,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Bounds every attempt with a timeout; an elapsed attempt counts as failed.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Per-attempt timeout, if any.
    #[must_use]
    pub const fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// The operation returned an error.
    #[error("{0}")]
    Failed(E),
    /// The operation did not finish within the attempt timeout.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> AttemptError<E> {
    /// Returns the operation error, if the attempt did not time out.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut(_) => None,
        }
    }
}

/// A successful result and the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Succeeded<T> {
    /// The produced value.
    pub value: T,
    /// Attempts used, starting at 1.
    pub attempts: u32,
}

/// Every attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last_error: AttemptError<E>,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Exhausted<E> {}

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<Succeeded<T>, Exhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_observed(policy, op, |_, _| {}).await
}

/// Like [`retry`], calling `observe` after every attempt with its outcome.
pub async fn retry_observed<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut op: F,
    mut observe: O,
) -> Result<Succeeded<T>, Exhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(u32, Result<&T, &AttemptError<E>>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(result) => result.map_err(AttemptError::Failed),
                Err(_) => Err(AttemptError::TimedOut(limit)),
            },
            None => op(attempt).await.map_err(AttemptError::Failed),
        };

        observe(attempt, outcome.as_ref());

        match outcome {
            Ok(value) => {
                return Ok(Succeeded {
                    value,
                    attempts: attempt,
                })
            }
            Err(last_error) if attempt >= max_attempts => {
                return Err(Exhausted {
                    attempts: attempt,
                    last_error,
                })
            }
            Err(err) => {
                debug!(attempt, max_attempts, error = %err, "attempt failed, retrying");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// A call exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {after:?}")]
pub struct TimedOut {
    /// The deadline that elapsed.
    pub after: Duration,
}

/// Awaits `fut`, failing with [`TimedOut`] once `limit` elapses.
pub async fn with_deadline<F>(limit: Duration, fut: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimedOut { after: limit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("ok") }
        })
        .await
        .expect("should succeed");

        assert_eq!(result.value, "ok");
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let result = retry(&policy, |attempt| async move {
            if attempt < 3 {
                Err(format!("transient {attempt}"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("should succeed on third attempt");

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_budget() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10));

        let err = retry(&policy, |attempt| async move { Err::<(), _>(format!("boom {attempt}")) })
            .await
            .expect_err("should exhaust");

        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error.to_string(), "boom 4");
        assert!(err.to_string().contains("gave up after 4 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_means_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let err = retry(&policy, |_| async { Err::<(), _>("nope") })
            .await
            .expect_err("should fail");
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5))
            .with_attempt_timeout(Duration::from_millis(50));

        let err = retry(&policy, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>(())
        })
        .await
        .expect_err("should time out");

        assert_eq!(err.attempts, 2);
        assert!(matches!(err.last_error, AttemptError::TimedOut(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut seen = Vec::new();

        let _ = retry_observed(
            &policy,
            |attempt| async move { if attempt == 2 { Ok(()) } else { Err("no") } },
            |attempt, outcome| seen.push((attempt, outcome.is_ok())),
        )
        .await;

        assert_eq!(seen, vec![(1, false), (2, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses() {
        let err = with_deadline(Duration::from_millis(20), tokio::time::sleep(Duration::from_secs(1)))
            .await
            .expect_err("deadline");
        assert_eq!(err.after, Duration::from_millis(20));

        let ok = with_deadline(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(ok, Ok(7));
    }
}
