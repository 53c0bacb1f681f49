#![forbid(unsafe_code)]

//! Bounded retry with exponential backoff for collaborator calls.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{FailureKind, FetchError, FetchResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub retry_on: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            retry_on: vec![FailureKind::NetworkError],
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Delay slept after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable kind, or the
/// attempt budget runs out. `op` receives the one-based attempt number.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut(u32) -> FetchResult<T>,
) -> FetchResult<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.is_retryable(err.kind) {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(FetchError::new(
                err.kind,
                format!("{} after {attempt} attempts", err.message),
            ));
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(
            target: "tubetask::retry",
            "attempt {attempt}/{max_attempts} for {label} failed: {err}; retrying in {:?}",
            delay
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_attempts(attempts)
            .with_initial_delay(Duration::ZERO)
    }

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let value = retry_with_backoff(&fast_policy(5), "ok", |_| {
            calls += 1;
            Ok::<_, FetchError>(42)
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_network_errors_until_success() {
        let mut calls = 0;
        let value = retry_with_backoff(&fast_policy(5), "flaky", |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(FetchError::network("timed out"))
            } else {
                Ok(attempt)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let err = retry_with_backoff(&fast_policy(4), "down", |_| {
            calls += 1;
            Err::<(), _>(FetchError::network("connection reset"))
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert_eq!(err.kind, FailureKind::NetworkError);
        assert!(err.message.contains("after 4 attempts"));
    }

    #[test]
    fn terminal_kinds_are_not_retried() {
        let mut calls = 0;
        let err = retry_with_backoff(&fast_policy(5), "disabled", |_| {
            calls += 1;
            Err::<(), _>(FetchError::disabled("captions off"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err, FetchError::disabled("captions off"));
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast_policy(1)
        };
        let mut calls = 0;
        let _ = retry_with_backoff(&policy, "zero", |_| {
            calls += 1;
            Err::<(), _>(FetchError::network("nope"))
        });
        assert_eq!(calls, 1);
    }
}
