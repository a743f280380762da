#![expect(
    clippy::module_name_repetitions,
    reason = "Retry types carry their domain in the name"
)]

use std::time::Duration;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Delay schedule for automatic call-site retries.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `min(base_delay * 2^retry_count, max_delay)`, saturating instead of overflowing.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        2_u32
            .checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
