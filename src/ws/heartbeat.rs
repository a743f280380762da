#![expect(
    clippy::module_name_repetitions,
    reason = "HeartbeatState is re-exported and read outside this module"
)]

use std::time::Duration;

use tokio::time::Instant;

use super::config::HeartbeatConfig;

/// Liveness bookkeeping for the open connection.
///
/// Purely observational: a degraded heartbeat is reported to callers but never closes or
/// reconnects the socket on its own.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatState {
    /// When the last ping was written
    pub last_sent_at: Option<Instant>,
    /// When the last frame of any kind was received
    pub last_seen_at: Option<Instant>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatState {
    #[must_use]
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            last_sent_at: None,
            last_seen_at: None,
            interval: config.interval,
            timeout: config.timeout,
        }
    }

    /// Fresh state for a connection that opened at `now`.
    #[must_use]
    pub fn opened(config: &HeartbeatConfig, now: Instant) -> Self {
        Self {
            last_seen_at: Some(now),
            ..Self::new(config)
        }
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
    }

    pub fn frame_seen(&mut self, now: Instant) {
        self.last_seen_at = Some(now);
    }

    /// Whether nothing has been received for longer than `timeout`.
    #[must_use]
    pub fn is_degraded(&self, now: Instant) -> bool {
        self.last_seen_at
            .is_some_and(|seen| now.saturating_duration_since(seen) > self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_only_after_timeout_of_silence() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(60));
        let start = Instant::now();
        let mut state = HeartbeatState::opened(&config, start);

        assert!(!state.is_degraded(start + Duration::from_secs(60)));
        assert!(state.is_degraded(start + Duration::from_secs(61)));

        state.frame_seen(start + Duration::from_secs(61));
        assert!(!state.is_degraded(start + Duration::from_secs(90)));
    }

    #[test]
    fn never_opened_is_not_degraded() {
        let state = HeartbeatState::new(&HeartbeatConfig::default());
        assert!(!state.is_degraded(Instant::now()));
        assert_eq!(state.last_sent_at, None);
    }
}
