//! Retry policy: exponential backoff with full jitter.
//!
//! Attempt numbers are zero-based; attempt 0 is the first call. The delay
//! before attempt `n + 1` is drawn uniformly from `[0, min(cap, base * 2^n)]`.

use std::time::Duration;

use rand::Rng;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            cap,
        }
    }

    /// Never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the jitter range for `attempt`: `min(cap, base * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.cap.as_millis() as u64;
        let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(exp).min(cap))
    }

    /// Full-jitter delay for `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Whether `error`, raised by attempt `attempt`, earns another attempt.
    /// Only retryable errors qualify, and never past `max_attempts`.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        error.is_retryable() && attempt.saturating_add(1) < self.max_attempts
    }

    /// Delay before retrying after `error`. An upstream `Retry-After` wins
    /// over the jittered backoff but is still clamped to `cap`.
    pub fn delay_for(&self, error: &Error, attempt: u32) -> Duration {
        match error.retry_after_ms() {
            Some(ms) => Duration::from_millis(ms).min(self.cap),
            None => self.next_delay(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1000))
    }

    fn reset() -> Error {
        Error::UpstreamConnection {
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.ceiling(0), Duration::from_millis(100));
        assert_eq!(p.ceiling(1), Duration::from_millis(200));
        assert_eq!(p.ceiling(3), Duration::from_millis(800));
        assert_eq!(p.ceiling(4), Duration::from_millis(1000));
        assert_eq!(p.ceiling(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_always_within_bounds() {
        let p = policy();
        for attempt in 0..12 {
            let ceiling = p.ceiling(attempt);
            for _ in 0..200 {
                assert!(p.next_delay(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn test_should_retry_respects_attempts_and_classification() {
        let p = policy();
        assert!(p.should_retry(&reset(), 0));
        assert!(p.should_retry(&reset(), 1));
        assert!(!p.should_retry(&reset(), 2));

        let rejected = Error::UpstreamRejected {
            status: 400,
            message: "bad request".into(),
        };
        assert!(!p.should_retry(&rejected, 0));
        let invalid = Error::validation_with_context("no messages", ErrorContext::new());
        assert!(!p.should_retry(&invalid, 0));
        assert!(!RetryPolicy::none().should_retry(&reset(), 0));
    }

    #[test]
    fn test_retry_after_is_clamped_to_cap() {
        let p = policy();
        let err = Error::UpstreamServer {
            status: 429,
            message: "slow down".into(),
            retry_after_ms: Some(30_000),
        };
        assert_eq!(p.delay_for(&err, 0), Duration::from_millis(1000));
        let err = Error::UpstreamServer {
            status: 503,
            message: "busy".into(),
            retry_after_ms: Some(250),
        };
        assert_eq!(p.delay_for(&err, 0), Duration::from_millis(250));
    }
}
