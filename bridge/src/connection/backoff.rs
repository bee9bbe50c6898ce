//! Reconnect backoff policy

use std::time::Duration;

/// Short exponential backoff for the first few failures, then a fixed long
/// interval while the printer stays unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base_delay: Duration,

    /// Growth factor between consecutive short delays
    pub multiplier: f64,

    /// Cap for the short delays
    pub max_short_delay: Duration,

    /// Number of failures handled with short delays
    pub short_attempts: u32,

    /// Delay once the short attempts are exhausted
    pub long_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_short_delay: Duration::from_secs(16),
            short_attempts: 5,
            long_interval: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        if failures > self.short_attempts {
            return self.long_interval;
        }
        let exponent = (failures - 1) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_short_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_short_delay)
    }
}
