//! Retry policy applied by monitors after gateway errors

use std::time::Duration;

/// Bounded exponential backoff for a single monitor
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive gateway errors tolerated before the monitor gives up
    pub max_consecutive_failures: u32,
    /// Delay after the first error
    pub initial_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Growth factor per consecutive error
    pub multiplier: f64,
    /// Give up after this many probes without confirmation
    pub max_polls: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            multiplier: 2.0,
            max_polls: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next probe after `failures` consecutive errors (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }

    pub fn polls_exhausted(&self, polls: u32) -> bool {
        self.max_polls.is_some_and(|max| polls >= max)
    }
}

impl From<&config::SettlementEngineConfig> for RetryPolicy {
    fn from(config: &config::SettlementEngineConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_retries,
            initial_delay: Duration::from_millis(config.backoff.initial_delay_ms),
            max_delay: Duration::from_millis(config.backoff.max_delay_ms),
            multiplier: config.backoff.multiplier,
            max_polls: config.max_polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy {
            max_consecutive_failures: 3,
            max_polls: Some(5),
            ..RetryPolicy::default()
        };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(!policy.polls_exhausted(4));
        assert!(policy.polls_exhausted(5));
        assert!(!RetryPolicy::default().polls_exhausted(u32::MAX));
    }

    #[test]
    fn test_from_config() {
        let config = config::SettlementEngineConfig {
            max_retries: 4,
            max_polls: Some(12),
            ..Default::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_consecutive_failures, 4);
        assert_eq!(policy.max_polls, Some(12));
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
    }
}
