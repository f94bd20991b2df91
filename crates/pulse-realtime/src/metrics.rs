//! Observability sink for hub internals.
//!
//! The hub reports through this trait and leaves the export format to the
//! embedding process.

use crate::buffer::WatermarkTransition;
use crate::connection::ConnectionMetrics;
use crate::protocol::CloseReason;
use crate::router::RouteReport;
use std::sync::Arc;

/// Receives hub metrics. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync {
    /// A connection was registered.
    fn connection_opened(&self, _id: &str) {}

    /// A connection was torn down.
    fn connection_closed(&self, _id: &str, _reason: CloseReason) {}

    /// An event was fanned out.
    fn event_routed(&self, _report: &RouteReport) {}

    /// Periodic per-connection snapshot (depth, dropped, heartbeat misses).
    fn connection_sampled(&self, _metrics: &ConnectionMetrics) {}

    /// A ping went unanswered.
    fn heartbeat_missed(&self, _id: &str, _missed: u32) {}

    /// A buffer crossed a watermark.
    fn watermark_crossed(&self, _id: &str, _transition: WatermarkTransition) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Shared sink handle.
pub type SharedMetricsSink = Arc<dyn MetricsSink>;
