//! Liveness tracking independent of transport keepalives.
//!
//! A single [`HeartbeatMonitor`] task pings every open connection on a fixed
//! interval and evicts those that stop answering.

use crate::config::HeartbeatConfig;
use crate::connection::ConnectionId;
use crate::protocol::{CloseReason, ServerMessage};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-connection heartbeat bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatState {
    last_ping_sent: Option<Instant>,
    last_pong_received: Option<Instant>,
    missed_pongs: u32,
    alive: bool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

/// What the monitor should do with a connection on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Send a ping now.
    SendPing,
    /// A ping is outstanding and still within its timeout.
    Wait,
    /// The connection is dead and must be closed.
    Evict,
}

impl HeartbeatState {
    /// Idle state: no ping sent yet.
    pub fn new() -> Self {
        Self {
            last_ping_sent: None,
            last_pong_received: None,
            missed_pongs: 0,
            alive: true,
        }
    }

    /// When the last ping was sent.
    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.last_ping_sent
    }

    /// When the last pong arrived.
    pub fn last_pong_received(&self) -> Option<Instant> {
        self.last_pong_received
    }

    /// Consecutive unanswered pings.
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    /// Whether the connection is still considered alive.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whether a ping has been sent and not yet answered.
    pub fn ping_outstanding(&self) -> bool {
        self.last_ping_sent.is_some() && self.last_pong_received.is_none()
    }

    /// Record a pong.
    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong_received = Some(now);
        self.missed_pongs = 0;
    }

    /// Record that a ping was sent.
    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
        self.last_pong_received = None;
    }

    /// Mark the connection dead.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Advance the state for a monitor tick.
    ///
    /// When the result is [`TickAction::SendPing`] the ping is recorded as
    /// sent at `now`.
    pub fn on_tick(&mut self, now: Instant, config: &HeartbeatConfig) -> TickAction {
        if !self.alive {
            return TickAction::Evict;
        }

        if self.ping_outstanding() {
            let sent = self.last_ping_sent.unwrap_or(now);
            if now.saturating_duration_since(sent) < config.pong_timeout {
                return TickAction::Wait;
            }
            self.missed_pongs += 1;
            if self.missed_pongs >= config.max_missed_pongs {
                self.alive = false;
                return TickAction::Evict;
            }
        }

        self.record_ping(now);
        TickAction::SendPing
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections pinged.
    pub pinged: usize,
    /// Connections evicted.
    pub evicted: Vec<ConnectionId>,
}

/// Periodic task pinging all open connections and evicting dead ones.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor using the registry's heartbeat settings.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let config = registry.config().heartbeat;
        Self { registry, config }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            interval_secs = self.config.interval.as_secs(),
            pong_timeout_secs = self.config.pong_timeout.as_secs(),
            max_missed = self.config.max_missed_pongs,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(Instant::now()).await;
                    debug!(pinged = report.pinged, evicted = report.evicted.len(), "Heartbeat tick");
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// Evaluate every open connection once.
    pub async fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let sink = self.registry.metrics_sink();

        for conn in self.registry.connections() {
            if !conn.state().is_open() {
                continue;
            }

            let missed_before = conn.heartbeat().missed_pongs();
            let action = conn.heartbeat_tick(now, &self.config);
            let missed = conn.heartbeat().missed_pongs();
            if missed > missed_before {
                sink.heartbeat_missed(&conn.id, missed);
            }

            match action {
                TickAction::Wait => {}
                TickAction::SendPing => {
                    if let Err(e) = conn.send_control(&ServerMessage::ping()) {
                        warn!(connection_id = %conn.id, error = %e, "Ping failed, evicting");
                        conn.mark_dead();
                        report.evicted.push(conn.id.clone());
                    } else {
                        report.pinged += 1;
                    }
                }
                TickAction::Evict => {
                    warn!(connection_id = %conn.id, missed = missed, "Heartbeat timeout, evicting");
                    report.evicted.push(conn.id.clone());
                }
            }

            // A close that started during this pass has already dropped the
            // per-connection series.
            if conn.is_open() {
                sink.connection_sampled(&conn.metrics());
            }
        }

        let closes = report
            .evicted
            .iter()
            .map(|id| self.registry.close(id, CloseReason::HeartbeatTimeout));
        futures::future::join_all(closes).await;

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::connection::ConnectionState;
    use crate::metrics::MetricsSink;
    use pulse_auth::Identity;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig::default()
    }

    #[test]
    fn test_first_tick_sends_ping() {
        let mut state = HeartbeatState::new();
        let now = Instant::now();
        assert_eq!(state.on_tick(now, &config()), TickAction::SendPing);
        assert!(state.ping_outstanding());
        assert_eq!(state.last_ping_sent(), Some(now));
    }

    #[test]
    fn test_pong_resets_missed_counter() {
        let cfg = config();
        let mut state = HeartbeatState::new();
        let t0 = Instant::now();

        state.on_tick(t0, &cfg);
        // Unanswered for a full interval
        assert_eq!(state.on_tick(t0 + cfg.interval, &cfg), TickAction::SendPing);
        assert_eq!(state.missed_pongs(), 1);

        state.record_pong(t0 + cfg.interval + Duration::from_secs(1));
        assert_eq!(state.missed_pongs(), 0);
        assert!(!state.ping_outstanding());

        assert_eq!(state.on_tick(t0 + cfg.interval * 2, &cfg), TickAction::SendPing);
        assert_eq!(state.missed_pongs(), 0);
    }

    #[test]
    fn test_outstanding_ping_within_timeout_waits() {
        let cfg = config();
        let mut state = HeartbeatState::new();
        let t0 = Instant::now();
        state.on_tick(t0, &cfg);
        assert_eq!(state.on_tick(t0 + Duration::from_secs(5), &cfg), TickAction::Wait);
        assert_eq!(state.missed_pongs(), 0);
        assert_eq!(state.last_ping_sent(), Some(t0));
    }

    #[test]
    fn test_evicts_after_max_missed() {
        let cfg = config();
        let mut state = HeartbeatState::new();
        let t0 = Instant::now();

        let mut actions = Vec::new();
        for i in 0..4 {
            actions.push(state.on_tick(t0 + cfg.interval * i, &cfg));
        }
        assert_eq!(
            actions,
            vec![
                TickAction::SendPing,
                TickAction::SendPing,
                TickAction::SendPing,
                TickAction::Evict
            ]
        );
        assert_eq!(state.missed_pongs(), 3);
        assert!(!state.is_alive());
        // Stays evicted
        assert_eq!(state.on_tick(t0 + cfg.interval * 5, &cfg), TickAction::Evict);
    }

    #[test]
    fn test_dead_connection_evicted() {
        let mut state = HeartbeatState::new();
        state.mark_dead();
        assert_eq!(state.on_tick(Instant::now(), &config()), TickAction::Evict);
    }

    #[tokio::test]
    async fn test_monitor_evicts_silent_connection() {
        let registry = Arc::new(ConnectionRegistry::new(HubConfig::default()));
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        let _control = conn.take_control_receiver().unwrap();
        let monitor = HeartbeatMonitor::new(registry.clone());
        let cfg = registry.config().heartbeat;

        let t0 = Instant::now();
        assert_eq!(monitor.tick(t0).await.pinged, 1);
        assert_eq!(monitor.tick(t0 + cfg.interval).await.pinged, 1);
        assert_eq!(monitor.tick(t0 + cfg.interval * 2).await.pinged, 1);

        let report = monitor.tick(t0 + cfg.interval * 3).await;
        assert_eq!(report.evicted, vec![conn.id.clone()]);
        assert!(registry.get(&conn.id).is_none());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert_eq!(registry.stats().heartbeat_evictions, 1);
    }

    #[tokio::test]
    async fn test_monitor_keeps_responsive_connection() {
        let registry = Arc::new(ConnectionRegistry::new(HubConfig::default()));
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        let mut control = conn.take_control_receiver().unwrap();
        let monitor = HeartbeatMonitor::new(registry.clone());
        let cfg = registry.config().heartbeat;

        let t0 = Instant::now();
        for i in 0..10u32 {
            let now = t0 + cfg.interval * i;
            let report = monitor.tick(now).await;
            assert!(report.evicted.is_empty());
            let ping = control.try_recv().unwrap();
            assert!(ping.contains("\"ping\""));
            conn.record_pong(now + Duration::from_secs(1));
        }
        assert!(registry.get(&conn.id).is_some());
    }

    #[derive(Default)]
    struct ClosingSink {
        target: parking_lot::Mutex<Option<Arc<crate::connection::Connection>>>,
        sampled: parking_lot::Mutex<Vec<String>>,
    }

    impl MetricsSink for ClosingSink {
        fn connection_sampled(&self, metrics: &crate::connection::ConnectionMetrics) {
            self.sampled.lock().push(metrics.id.clone());
        }

        fn heartbeat_missed(&self, _id: &str, _missed: u32) {
            if let Some(conn) = self.target.lock().as_ref() {
                conn.begin_draining(CloseReason::ClientInitiated);
            }
        }
    }

    #[tokio::test]
    async fn test_no_sample_for_connection_closed_mid_tick() {
        let sink = Arc::new(ClosingSink::default());
        let registry = Arc::new(ConnectionRegistry::with_metrics(HubConfig::default(), sink.clone()));
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        let _control = conn.take_control_receiver().unwrap();
        let monitor = HeartbeatMonitor::new(registry.clone());
        let cfg = registry.config().heartbeat;

        let t0 = Instant::now();
        monitor.tick(t0).await;
        assert_eq!(sink.sampled.lock().len(), 1);

        *sink.target.lock() = Some(conn.clone());
        monitor.tick(t0 + cfg.interval).await;
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(sink.sampled.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_send_failure_evicts_immediately() {
        let registry = Arc::new(ConnectionRegistry::new(HubConfig::default()));
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        // Dropping the receiver simulates a send loop that already exited
        drop(conn.take_control_receiver());

        let monitor = HeartbeatMonitor::new(registry.clone());
        let report = monitor.tick(Instant::now()).await;
        assert_eq!(report.evicted, vec![conn.id.clone()]);
        assert!(registry.get(&conn.id).is_none());
    }
}
