//! Bounded exponential backoff for transient client errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first (default: 5).
    pub max_attempts: u32,
    /// Delay after the first failure (default: 500ms).
    pub base_delay: Duration,
    /// Upper bound for the exponential delay (default: 30s).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`, and never
    /// shorter than a wait the service asked for.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4, None), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(1000));
    }

    #[test]
    fn test_rate_limit_hint_raises_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(policy.delay_for(1, Some(Duration::from_millis(10))), Duration::from_millis(500));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
