use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::job::ErrorKind;

/// Bounded retry policy attached to every workflow run.
///
/// `max_attempts` counts the first attempt, so a policy with
/// `max_attempts = 1` never retries. The backoff is a fixed delay.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    retryable: BTreeSet<ErrorKind>,
    max_attempts: u32,
    backoff: Duration,
    attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable: [
                ErrorKind::NoCapacityAvailable,
                ErrorKind::LaunchRejected,
                ErrorKind::Timeout,
            ]
            .into_iter()
            .collect(),
            max_attempts: 3,
            backoff: Duration::from_secs(30),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Build a policy. `max_attempts` is clamped to at least one.
    pub fn new(
        retryable: impl IntoIterator<Item = ErrorKind>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            retryable: retryable.into_iter().collect(),
            max_attempts: max_attempts.max(1),
            backoff,
            attempt_timeout: None,
        }
    }

    /// Plain scheduled execution: a single attempt, nothing retried.
    pub fn no_retry() -> Self {
        Self::new(std::iter::empty(), 1, Duration::ZERO)
    }

    /// Retry every kind in the taxonomy.
    pub fn retry_all(max_attempts: u32, backoff: Duration) -> Self {
        Self::new(ErrorKind::ALL, max_attempts, backoff)
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Decide what follows a failed attempt.
    ///
    /// `attempts_made` is the run's attempt count including the attempt that
    /// just failed.
    pub fn decide(&self, kind: ErrorKind, attempts_made: u32) -> RetryDecision {
        if !self.is_retryable(kind) {
            RetryDecision::Fail
        } else if attempts_made >= self.max_attempts {
            RetryDecision::Exhaust
        } else {
            RetryDecision::Retry {
                after: self.backoff,
            }
        }
    }
}

/// Outcome of consulting a [`RetryPolicy`] after a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Wait `after`, then launch again.
    Retry { after: Duration },
    /// The error is not retryable; the run fails.
    Fail,
    /// The error is retryable but the attempt budget is spent.
    Exhaust,
}
