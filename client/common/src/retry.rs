//! Attempt-with-backoff primitive.
//!
//! Separates retryable from terminal failures: an operation reports each
//! failure as [`AttemptError::Retryable`] or [`AttemptError::Fatal`], and
//! the engine either re-runs it after the configured backoff or returns
//! the fatal error untouched. Backoff sleeps are plain tokio sleeps, so
//! dropping the returned future cancels the wait immediately.

use std::future::Future;
use std::time::Duration;

/// Delay schedule indexed by attempt number. The first attempt (attempt
/// 0) always runs immediately.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `delay(a) = a² · base`
    Exponential(Duration),
    /// `delay(a) = a · base`
    Linear(Duration),
    /// `delay(a) = d` for every attempt after the first.
    Constant(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Exponential(base) => base * attempt * attempt,
            Backoff::Linear(base) => base * attempt,
            Backoff::Constant(d) => {
                if attempt == 0 {
                    Duration::ZERO
                } else {
                    d
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// How an attempt failed, as reported by the operation itself.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth retrying within the policy's budget.
    Retryable(E),
    /// Terminal: the engine returns this error at once.
    Fatal(E),
}

impl<E> AttemptError<E> {
    pub fn into_inner(self) -> E {
        match self {
            AttemptError::Retryable(e) | AttemptError::Fatal(e) => e,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retryable error.
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    /// The operation reported a terminal failure.
    #[error(transparent)]
    Fatal(E),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or the attempt budget is
/// exhausted. The attempt index (0-based) is passed to `op`.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let delay = policy.backoff.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(e)) => return Err(RetryError::Fatal(e)),
            Err(AttemptError::Retryable(e)) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: max_attempts,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[tokio::test]
    async fn succeeds_after_k_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Backoff::Constant(Duration::from_millis(1)));
        let result: Result<u32, _> = retry(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(AttemptError::Retryable(Boom(attempt)))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::Constant(Duration::from_millis(1)));
        let result: Result<(), _> = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::Fatal(Boom(7))) }
        })
        .await;
        match result {
            Err(RetryError::Fatal(Boom(7))) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_cause() {
        let policy = RetryPolicy::new(3, Backoff::Constant(Duration::from_millis(1)));
        let result: Result<(), _> = retry(&policy, |attempt| async move {
            Err(AttemptError::Retryable(Boom(attempt)))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "failed after 3 attempts: boom 2");
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_schedule() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3, Backoff::Exponential(Duration::from_secs(1)));
        let _: Result<(), _> = retry(&policy, |_| async { Err(AttemptError::Retryable(Boom(0))) })
            .await;
        // Sleeps before attempts 1 and 2: 1s + 4s.
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn linear_backoff_schedule() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3, Backoff::Linear(Duration::from_secs(2)));
        let _: Result<(), _> = retry(&policy, |_| async { Err(AttemptError::Retryable(Boom(0))) })
            .await;
        // 2s + 4s.
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn first_attempt_has_no_delay() {
        assert_eq!(
            Backoff::Exponential(Duration::from_secs(3)).delay(0),
            Duration::ZERO
        );
        assert_eq!(
            Backoff::Linear(Duration::from_secs(3)).delay(0),
            Duration::ZERO
        );
        assert_eq!(
            Backoff::Constant(Duration::from_secs(3)).delay(0),
            Duration::ZERO
        );
        assert_eq!(
            Backoff::Constant(Duration::from_secs(3)).delay(5),
            Duration::from_secs(3)
        );
    }
}
