// Exponential backoff schedule for busy-store retries

use std::time::Duration;

use crate::config::PersistenceConfig;

/// Retry budget for one write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before attempt `attempt + 1`, after `attempt` busy failures.
    ///
    /// Doubles from `base_delay` and saturates at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_after(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![25, 50, 100, 200, 400, 400]);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));

        let single = RetryPolicy::from_config(&PersistenceConfig {
            max_attempts: 0,
            ..PersistenceConfig::default()
        });
        assert_eq!(single.max_attempts, 1);
        assert!(!single.allows_retry(1));
    }
}
