//! Exponential backoff with jitter for rate-limited panel calls.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule applied when the panel signals rate limiting.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// First delay
    pub base: Duration,
    /// Ceiling for any single delay
    pub cap: Duration,
    /// Retries after the initial attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), jittered by up to
    /// ±25% so stalled workers do not re-synchronize against the panel.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);

        let jitter_range = exp.as_millis() as i64 / 4;
        if jitter_range == 0 {
            return exp;
        }
        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        let millis = (exp.as_millis() as i64 + jitter).max(0) as u64;
        Duration::from_millis(millis).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = BackoffPolicy::default();

        // Jitter is ±25%, so bound each delay rather than pin it
        let d0 = policy.delay_for(0);
        assert!(d0 >= Duration::from_millis(375) && d0 <= Duration::from_millis(625));

        let d1 = policy.delay_for(1);
        assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1250));

        // Far past the cap
        let d10 = policy.delay_for(10);
        assert!(d10 <= Duration::from_secs(10));
    }

    #[test]
    fn test_zero_base_is_safe() {
        let policy = BackoffPolicy {
            base: Duration::ZERO,
            cap: Duration::from_secs(1),
            max_retries: 3,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }
}
