use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with full jitter for transport failures.
///
/// Parse and schema failures are never backed off; they get a fresh
/// generation call immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Transport retries allowed per attempt slot
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries,
        }
    }

    /// Upper bound of the delay before retry number `retry` (0-based)
    pub fn ceiling(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(2u64.saturating_pow(retry));
        Duration::from_millis(exp.min(self.max_delay.as_millis() as u64))
    }

    /// Jittered delay before retry number `retry`, uniform in [0, ceiling]
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        if ceiling == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_retries: 5,
        };
        assert_eq!(policy.ceiling(0), Duration::from_millis(100));
        assert_eq!(policy.ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.ceiling(3), Duration::from_millis(500));
        assert_eq!(policy.ceiling(40), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let policy = RetryPolicy::default();
        for retry in 0..6 {
            assert!(policy.delay(retry) <= policy.ceiling(retry));
        }
        assert_eq!(RetryPolicy::immediate(2).delay(3), Duration::ZERO);
    }
}
