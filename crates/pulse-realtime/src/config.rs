//! Hub tunables.

use std::time::Duration;

/// Default per-connection buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Default maximum number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default maximum subscriptions per connection.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 100;

/// Protocol version assumed when the client does not ask for one.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Protocol versions this hub speaks.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1];

/// Message buffer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferConfig {
    /// Maximum number of queued payloads.
    pub capacity: usize,
    /// Fill ratio at which the connection is paused.
    pub high_watermark: f64,
    /// Fill ratio at which a paused connection resumes.
    pub low_watermark: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            high_watermark: 0.8,
            low_watermark: 0.5,
        }
    }
}

impl BufferConfig {
    /// Create a config with the given capacity and default watermarks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Depth at which the high watermark is reached.
    pub fn high_mark(&self) -> usize {
        ((self.capacity as f64 * self.high_watermark).round() as usize).clamp(1, self.capacity.max(1))
    }

    /// Depth at or below which the low watermark is reached.
    pub fn low_mark(&self) -> usize {
        ((self.capacity as f64 * self.low_watermark).round() as usize).min(self.high_mark() - 1)
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between monitor ticks.
    pub interval: Duration,
    /// Time a ping may stay unanswered before it counts as missed.
    pub pong_timeout: Duration,
    /// Missed pongs after which the connection is evicted.
    pub max_missed_pongs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed_pongs: 3,
        }
    }
}

/// Top-level hub configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
    /// Per-connection buffer settings.
    pub buffer: BufferConfig,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// How long the send loop sleeps when it has nothing to write.
    pub idle_poll_interval: Duration,
    /// How long a closing session may spend flushing its buffer.
    pub drain_timeout: Duration,
    /// How long teardown waits for the session loops before abandoning them.
    pub teardown_grace: Duration,
    /// Capacity of the per-connection control queue (pings, acks).
    pub control_queue_capacity: usize,
    /// Capacity of the event ingest channel.
    pub ingest_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_subscriptions_per_connection: DEFAULT_MAX_SUBSCRIPTIONS,
            buffer: BufferConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            idle_poll_interval: Duration::from_millis(25),
            drain_timeout: Duration::from_secs(1),
            teardown_grace: Duration::from_secs(5),
            control_queue_capacity: 32,
            ingest_capacity: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_marks() {
        let config = BufferConfig::default();
        assert_eq!(config.high_mark(), 800);
        assert_eq!(config.low_mark(), 500);
    }

    #[test]
    fn test_marks_small_capacity() {
        let config = BufferConfig::with_capacity(10);
        assert_eq!(config.high_mark(), 8);
        assert_eq!(config.low_mark(), 5);

        let tiny = BufferConfig::with_capacity(1);
        assert_eq!(tiny.high_mark(), 1);
        assert_eq!(tiny.low_mark(), 0);
    }

    #[test]
    fn test_heartbeat_defaults() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.interval, Duration::from_secs(30));
        assert_eq!(hb.pong_timeout, Duration::from_secs(10));
        assert_eq!(hb.max_missed_pongs, 3);
    }
}
