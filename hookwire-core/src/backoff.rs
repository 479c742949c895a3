// ABOUTME: Exponential backoff for watcher poll cycles
// ABOUTME: Doubles from the base interval on failure up to a ceiling; success resets to base

use std::time::Duration;

/// Backoff configuration for a tenant's poll loop
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay between cycles when everything is healthy
    pub base: Duration,
    /// Upper bound on the delay after repeated failures
    pub ceiling: Duration,
    /// Multiplier applied to the delay after each failure
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            ceiling: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

/// Tracks the delay before the next poll cycle.
///
/// The first failure sleeps `base`, then `2*base`, `4*base`... capped at
/// `ceiling`. There is no retry limit: a watcher keeps retrying until it is
/// stopped.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.base;
        Self {
            config,
            consecutive_failures: 0,
            current_delay,
        }
    }

    /// Record a healthy cycle and return the delay before the next one (base)
    pub fn record_success(&mut self) -> Duration {
        self.consecutive_failures = 0;
        self.current_delay = self.config.base;
        self.config.base
    }

    /// Record a failed cycle and return the delay before the next one
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let delay = self.current_delay.min(self.config.ceiling);

        self.current_delay = self
            .current_delay
            .saturating_mul(self.config.multiplier)
            .min(self.config.ceiling);

        delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay the next failure would produce
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn base(&self) -> Duration {
        self.config.base
    }
}
