#![expect(
    clippy::module_name_repetitions,
    reason = "ReconnectPolicy is re-exported and read outside this module"
)]

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use super::config::ReconnectConfig;

/// Attempt counter and delay schedule for one outage.
///
/// The n-th reconnect of an outage waits `min(base_delay * 2^(n-1), max_delay)`.
#[derive(Debug)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            backoff: config.into(),
        }
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay before the next reconnect, counting it as an attempt.
    ///
    /// Returns `None` once `max_attempts` reconnects have been scheduled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.backoff.next_backoff()?;
        self.attempt += 1;
        Some(delay)
    }

    /// Start a fresh outage; called after every successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.backoff.reset();
    }

    /// Block further automatic reconnects until the next [`reset`](Self::reset).
    pub fn exhaust(&mut self) {
        self.attempt = self.max_attempts;
    }
}
