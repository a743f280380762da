#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// Number of buffered inbound messages that forces an immediate flush.
pub const MESSAGE_BATCH_SIZE: usize = 50;
/// Longest time the first unflushed inbound message waits before being dispatched.
pub const BUFFER_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_ACK_KIND: &str = "pong";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the connection manager.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a connection attempt may take before it is abandoned
    pub connect_timeout: Duration,
    /// Liveness probing while the connection is open
    pub heartbeat: HeartbeatConfig,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    /// Inbound buffering thresholds
    pub batch: BatchConfig,
    /// Where batches of inbound messages are turned into events
    pub processor: ProcessorMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            batch: BatchConfig::default(),
            processor: ProcessorMode::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    #[must_use]
    pub fn with_processor(mut self, processor: ProcessorMode) -> Self {
        self.processor = processor;
        self
    }
}

/// Configuration for the heartbeat ticker.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval for sending liveness pings
    pub interval: Duration,
    /// Silence after which liveness is reported as degraded
    pub timeout: Duration,
    /// Inbound message kind acknowledging a ping; never forwarded to subscribers
    pub ack_kind: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            ack_kind: DEFAULT_HEARTBEAT_ACK_KIND.to_owned(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Self::default()
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts within one outage
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Upper bound for any reconnection delay
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.base_delay)
            .with_max_interval(config.max_delay)
            .with_multiplier(BACKOFF_MULTIPLIER)
            // Delays must be exactly base * 2^attempt
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // Attempts are capped separately
            .build()
    }
}

/// Thresholds for the inbound buffer.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: MESSAGE_BATCH_SIZE,
            flush_interval: BUFFER_FLUSH_INTERVAL,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size,
            flush_interval,
        }
    }
}

/// Selects the batch processor at construction time.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessorMode {
    /// Use a worker task on multi-threaded runtimes, inline dispatch otherwise
    #[default]
    Auto,
    /// Always hand batches to a dedicated worker task
    Worker,
    /// Always dispatch batches synchronously on the connection task
    Inline,
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff < Duration::from_millis(1),
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn backoff_sequence_doubles_without_jitter() {
        let config = ReconnectConfig::new(5, Duration::from_secs(1), Duration::from_secs(30));
        let mut backoff: ExponentialBackoff = (&config).into();

        for expected in [1, 2, 4, 8, 16] {
            assert_close(backoff.next_backoff().unwrap(), Duration::from_secs(expected));
        }
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig::new(10, Duration::from_secs(1), Duration::from_secs(3));
        let mut backoff: ExponentialBackoff = (&config).into();

        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        assert_close(backoff.next_backoff().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();

        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.batch.batch_size, MESSAGE_BATCH_SIZE);
        assert_eq!(config.batch.flush_interval, BUFFER_FLUSH_INTERVAL);
        assert_eq!(config.heartbeat.ack_kind, "pong");
        assert_eq!(config.processor, ProcessorMode::Auto);
    }
}
