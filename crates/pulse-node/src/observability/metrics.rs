//! Prometheus metrics collection.
//!
//! Provides metrics for:
//! - HTTP request latency and counts
//! - Connection lifecycle and heartbeat evictions
//! - Event routing and drop-oldest losses
//! - Per-connection buffer depth, dropped count and missed pongs

use parking_lot::RwLock;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use pulse_realtime::{CloseReason, ConnectionMetrics, MetricsSink, RouteReport, WatermarkTransition};
use std::sync::Arc;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request path
    pub path: String,
    /// Response status code
    pub status: u16,
}

/// Close reason labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CloseLabels {
    pub reason: String,
}

/// Watermark direction.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    Paused,
    Resumed,
}

/// Watermark transition labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatermarkLabels {
    pub direction: Direction,
}

/// Per-connection labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    pub connection_id: String,
}

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// HTTP request counter.
    pub http_requests_total: Family<HttpLabels, Counter>,
    /// HTTP request duration histogram (seconds).
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
    /// Requests in flight.
    pub http_active_requests: Gauge,
    /// Live WebSocket connections.
    pub connections_active: Gauge,
    /// Connections registered since start.
    pub connections_opened: Counter,
    /// Connections closed, by reason.
    pub connections_closed: Family<CloseLabels, Counter>,
    /// Events routed.
    pub events_routed: Counter,
    /// Payloads enqueued into connection buffers.
    pub event_deliveries: Counter,
    /// Payloads discarded by drop-oldest.
    pub messages_dropped: Counter,
    /// Unanswered pings.
    pub heartbeat_misses: Counter,
    /// Connections evicted by the heartbeat monitor.
    pub heartbeat_evictions: Counter,
    /// Buffer watermark crossings.
    pub watermark_transitions: Family<WatermarkLabels, Counter>,
    /// Per-connection buffer depth.
    pub connection_buffer_depth: Family<ConnectionLabels, Gauge>,
    /// Per-connection dropped payloads.
    pub connection_dropped: Family<ConnectionLabels, Gauge>,
    /// Per-connection consecutive missed pongs.
    pub connection_missed_pongs: Family<ConnectionLabels, Gauge>,
}

impl std::fmt::Debug for MetricsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsState").finish_non_exhaustive()
    }
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Create a new metrics state with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // HTTP metrics
        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "pulse_http_requests",
            "Total HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "pulse_http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_requests = Gauge::default();
        registry.register(
            "pulse_http_active_requests",
            "HTTP requests in flight",
            http_active_requests.clone(),
        );

        // Connection lifecycle
        let connections_active = Gauge::default();
        registry.register(
            "pulse_connections_active",
            "Live WebSocket connections",
            connections_active.clone(),
        );

        let connections_opened = Counter::default();
        registry.register(
            "pulse_connections",
            "Connections registered since start",
            connections_opened.clone(),
        );

        let connections_closed = Family::<CloseLabels, Counter>::default();
        registry.register(
            "pulse_connections_closed",
            "Connections closed by reason",
            connections_closed.clone(),
        );

        // Routing
        let events_routed = Counter::default();
        registry.register("pulse_events_routed", "Events routed", events_routed.clone());

        let event_deliveries = Counter::default();
        registry.register(
            "pulse_event_deliveries",
            "Payloads enqueued into connection buffers",
            event_deliveries.clone(),
        );

        let messages_dropped = Counter::default();
        registry.register(
            "pulse_messages_dropped",
            "Payloads discarded by drop-oldest backpressure",
            messages_dropped.clone(),
        );

        // Heartbeat
        let heartbeat_misses = Counter::default();
        registry.register(
            "pulse_heartbeat_misses",
            "Pings left unanswered past the pong timeout",
            heartbeat_misses.clone(),
        );

        let heartbeat_evictions = Counter::default();
        registry.register(
            "pulse_heartbeat_evictions",
            "Connections evicted by the heartbeat monitor",
            heartbeat_evictions.clone(),
        );

        // Buffers
        let watermark_transitions = Family::<WatermarkLabels, Counter>::default();
        registry.register(
            "pulse_watermark_transitions",
            "Buffer watermark crossings",
            watermark_transitions.clone(),
        );

        let connection_buffer_depth = Family::<ConnectionLabels, Gauge>::default();
        registry.register(
            "pulse_connection_buffer_depth",
            "Queued payloads per connection",
            connection_buffer_depth.clone(),
        );

        let connection_dropped = Family::<ConnectionLabels, Gauge>::default();
        registry.register(
            "pulse_connection_dropped",
            "Dropped payloads per connection",
            connection_dropped.clone(),
        );

        let connection_missed_pongs = Family::<ConnectionLabels, Gauge>::default();
        registry.register(
            "pulse_connection_missed_pongs",
            "Consecutive missed pongs per connection",
            connection_missed_pongs.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests_total,
            http_request_duration_seconds,
            http_active_requests,
            connections_active,
            connections_opened,
            connections_closed,
            events_routed,
            event_deliveries,
            messages_dropped,
            heartbeat_misses,
            heartbeat_evictions,
            watermark_transitions,
            connection_buffer_depth,
            connection_dropped,
            connection_missed_pongs,
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: path.to_string(),
            status,
        };

        self.http_requests_total.get_or_create(&labels).inc();
        self.http_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Encode metrics for Prometheus scraping.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }

    fn connection_labels(id: &str) -> ConnectionLabels {
        ConnectionLabels {
            connection_id: id.to_string(),
        }
    }
}

impl MetricsSink for MetricsState {
    fn connection_opened(&self, _id: &str) {
        self.connections_opened.inc();
        self.connections_active.inc();
    }

    fn connection_closed(&self, id: &str, reason: CloseReason) {
        self.connections_active.dec();
        self.connections_closed
            .get_or_create(&CloseLabels {
                reason: reason.as_str().to_string(),
            })
            .inc();
        if reason == CloseReason::HeartbeatTimeout {
            self.heartbeat_evictions.inc();
        }

        let labels = Self::connection_labels(id);
        self.connection_buffer_depth.remove(&labels);
        self.connection_dropped.remove(&labels);
        self.connection_missed_pongs.remove(&labels);
    }

    fn event_routed(&self, report: &RouteReport) {
        self.events_routed.inc();
        self.event_deliveries.inc_by(report.delivered as u64);
        self.messages_dropped.inc_by(report.dropped as u64);
    }

    fn connection_sampled(&self, metrics: &ConnectionMetrics) {
        let labels = Self::connection_labels(&metrics.id);
        self.connection_buffer_depth
            .get_or_create(&labels)
            .set(metrics.buffer.depth as i64);
        self.connection_dropped
            .get_or_create(&labels)
            .set(metrics.buffer.dropped as i64);
        self.connection_missed_pongs
            .get_or_create(&labels)
            .set(metrics.missed_pongs as i64);
    }

    fn heartbeat_missed(&self, _id: &str, _missed: u32) {
        self.heartbeat_misses.inc();
    }

    fn watermark_crossed(&self, _id: &str, transition: WatermarkTransition) {
        let direction = match transition {
            WatermarkTransition::Paused => Direction::Paused,
            WatermarkTransition::Resumed => Direction::Resumed,
        };
        self.watermark_transitions
            .get_or_create(&WatermarkLabels { direction })
            .inc();
    }
}
