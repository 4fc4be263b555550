//! Reconnect delay policy.

use std::time::Duration;

/// Exponential reconnect backoff.
///
/// The delay before retry `n` (counting from zero) is
/// `initial * multiplier^n`, capped at `max`. A healthy session resets the
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: u32,
    /// Consecutive failures tolerated before giving up (`None`: unbounded)
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay with unbounded retries.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1,
            max_retries: None,
        }
    }

    /// Delay before retry number `attempts`.
    #[must_use]
    pub fn calculate_backoff(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempts).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Whether another retry is allowed after `attempts` consecutive failures.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }

    /// Start a fresh retry sequence.
    #[must_use]
    pub fn start(self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self,
            attempts: 0,
        }
    }
}

/// Retry sequence driven by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if !self.policy.allows(self.attempts) {
            return None;
        }
        let delay = self.policy.calculate_backoff(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Consecutive failures so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_backoff() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.calculate_backoff(0), Duration::from_millis(250));
        assert_eq!(backoff.calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(backoff.calculate_backoff(2), Duration::from_secs(1));
        assert_eq!(backoff.calculate_backoff(6), Duration::from_secs(16));
        assert_eq!(backoff.calculate_backoff(7), Duration::from_secs(30));
        assert_eq!(backoff.calculate_backoff(200), Duration::from_secs(30));
        assert!(backoff.allows(u32::MAX));
    }

    #[test]
    fn constant_backoff() {
        let backoff = BackoffPolicy::constant(Duration::from_millis(10));
        assert_eq!(backoff.calculate_backoff(0), Duration::from_millis(10));
        assert_eq!(backoff.calculate_backoff(50), Duration::from_millis(10));
    }

    #[test]
    fn bounded_retries() {
        let backoff = BackoffPolicy {
            max_retries: Some(2),
            ..BackoffPolicy::default()
        };
        assert!(backoff.allows(0));
        assert!(backoff.allows(1));
        assert!(!backoff.allows(2));
    }

    #[test]
    fn sequence_exhausts_and_resets() {
        let mut backoff = BackoffPolicy {
            max_retries: Some(2),
            ..BackoffPolicy::default()
        }
        .start();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(250)));
    }
}
