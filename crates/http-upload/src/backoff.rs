use std::time::Duration;

/// Configuration for retrying failed chunk uploads with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent consecutive failure.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
        }
    }
}

impl RetryConfig {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exp);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }
}

/// Consecutive-failure counter for one upload loop.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    config: RetryConfig,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.time_until_next_retry()
    }

    /// Wait owed for the failures recorded so far.
    pub fn time_until_next_retry(&self) -> Duration {
        self.config.delay_for_attempt(self.failures)
    }

    /// Back to the floor after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
