//! Provider retry policy
//!
//! 429/5xx-class statuses are transient and retried with exponential
//! backoff plus jitter; auth and client errors fail immediately.

use rand::Rng;
use std::time::Duration;

/// Statuses worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 529)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based), jittered ±25%.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let base = self.base_delay.as_millis() as u64 * (1u64 << exponent);
        let capped = base.min(self.max_delay.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        Duration::from_millis((capped as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 529] {
            assert!(is_retryable_status(status), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 200] {
            assert!(!is_retryable_status(status), "{} should not retry", status);
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(187));
        assert!(first <= Duration::from_millis(313));
        // Far beyond the cap, delay stays bounded.
        assert!(policy.delay_for(20) <= Duration::from_millis(10_000));
    }
}
