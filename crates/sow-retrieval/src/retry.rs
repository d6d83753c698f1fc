//! Bounded retry with exponential backoff and per-call timeout

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether a retry may help
pub trait Transient {
    /// Whether the failure is worth retrying
    fn is_transient(&self) -> bool;
}

impl Transient for crate::error::KnowledgeError {
    fn is_transient(&self) -> bool {
        crate::error::KnowledgeError::is_transient(self)
    }
}

/// Retry budget for one external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt (doubles each retry)
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Timeout applied to every attempt
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = duration_ms(initial);
        self.max_backoff_ms = duration_ms(max);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before attempt `attempt` (1-based; the first attempt has none)
    #[must_use]
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << doublings)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out
    ///
    /// `op` receives the 1-based attempt number. Every attempt is bounded by
    /// the policy timeout; a timeout counts as a transient failure.
    /// `on_failure` observes every failed attempt in order.
    ///
    /// # Errors
    /// - `RetryError::Permanent` on the first non-transient failure
    /// - `RetryError::Exhausted` once every attempt failed transiently
    pub async fn run<T, E, F, Fut, O>(
        &self,
        label: &str,
        mut op: F,
        mut on_failure: O,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Transient + Display + std::fmt::Debug,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(u32, &AttemptFailure<E>),
    {
        let attempts = self.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            let delay = self.backoff_before(attempt);
            if !delay.is_zero() {
                tracing::warn!(label, attempt, max_attempts = attempts, backoff_ms = %delay.as_millis(), "retrying");
                tokio::time::sleep(delay).await;
            }

            let failure = match tokio::time::timeout(self.timeout(), op(attempt)).await {
                Ok(Ok(value)) => {
                    return Ok(Attempted { value, attempts: attempt });
                }
                Ok(Err(e)) => AttemptFailure::Failed(e),
                Err(_) => AttemptFailure::TimedOut(self.timeout()),
            };

            tracing::debug!(label, attempt, error = %failure, "attempt failed");
            on_failure(attempt, &failure);
            match failure {
                AttemptFailure::Failed(error) if !error.is_transient() => {
                    return Err(RetryError::Permanent {
                        attempts: attempt,
                        error,
                    });
                }
                other => last = Some(other),
            }
        }

        Err(RetryError::Exhausted {
            attempts,
            last: last.map(|f| f.to_string()).unwrap_or_default(),
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A successful call and how many attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// One failed attempt
#[derive(Debug)]
pub enum AttemptFailure<E> {
    /// The attempt hit the policy timeout
    TimedOut(Duration),
    /// The call itself failed
    Failed(E),
}

impl<E: Display> Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::TimedOut(d) => write!(f, "timed out after {d:?}"),
            AttemptFailure::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Retry outcome when no attempt succeeded
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Debug + Display> {
    /// Every attempt failed transiently
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// A non-transient failure stopped retrying
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent { attempts: u32, error: E },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnowledgeError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(15))
            .with_timeout(Duration::from_millis(50))
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::default().with_backoff(Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(policy.backoff_before(1), Duration::ZERO);
        assert_eq!(policy.backoff_before(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(4), Duration::from_millis(250));
        assert_eq!(policy.backoff_before(60), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let mut seen = Vec::new();
        let out = fast()
            .run(
                "query",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(KnowledgeError::Unavailable("flaky".into()))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |attempt, _| seen.push(attempt),
            )
            .await
            .unwrap();
        assert_eq!(out.value, 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_the_budget() {
        let out: Result<Attempted<()>, _> = fast()
            .run(
                "query",
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), KnowledgeError>(())
                },
                |_, failure| assert!(matches!(failure, AttemptFailure::TimedOut(_))),
            )
            .await;
        assert!(matches!(out, Err(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<Attempted<()>, _> = fast()
            .run(
                "query",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(KnowledgeError::Rejected("bad filter".into())) }
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(out, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
