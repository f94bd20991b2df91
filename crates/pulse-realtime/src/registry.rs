//! Connection registry: the single owner of connection lifecycle.

use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionId, ConnectionMetrics};
use crate::error::{HubError, Result};
use crate::event::EventType;
use crate::metrics::{MetricsSink, NoopMetrics, SharedMetricsSink};
use crate::protocol::CloseReason;
use crate::router::RouteReport;
use crate::subscription::{ClusterFilter, SubscriptionIndex};
use parking_lot::RwLock;
use pulse_auth::Identity;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of live connections.
///
/// Owns every [`Connection`] together with its buffer, heartbeat state and
/// subscription index entries; creation and teardown happen only here.
pub struct ConnectionRegistry {
    config: HubConfig,
    /// Live connections indexed by ID.
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Subscription index shared with the router.
    subscriptions: SubscriptionIndex,
    /// Statistics.
    stats: RwLock<HubStats>,
    metrics: SharedMetricsSink,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connection_count())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Create a registry that discards metrics.
    pub fn new(config: HubConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Create a registry reporting to a metrics sink.
    pub fn with_metrics(config: HubConfig, metrics: SharedMetricsSink) -> Self {
        let subscriptions = SubscriptionIndex::new(config.max_subscriptions_per_connection);
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            subscriptions,
            stats: RwLock::new(HubStats::default()),
            metrics,
        }
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Metrics sink.
    pub fn metrics_sink(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    /// Subscription index.
    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.subscriptions
    }

    /// Register an authenticated client.
    pub fn register(&self, identity: Identity, protocol_version: u32) -> Result<Arc<Connection>> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = Arc::new(Connection::new(id.clone(), identity, protocol_version, &self.config));

        {
            let mut connections = self.connections.write();
            if connections.len() >= self.config.max_connections {
                warn!(max = self.config.max_connections, "Connection capacity exceeded");
                return Err(HubError::CapacityExceeded(self.config.max_connections));
            }
            connections.insert(id.clone(), conn.clone());
        }

        self.stats.write().total_connections += 1;
        self.metrics.connection_opened(&id);

        info!(
            connection_id = %id,
            subject = %conn.identity.subject,
            protocol_version = protocol_version,
            "Connection registered"
        );

        Ok(conn)
    }

    /// Get a connection by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Snapshot of all live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Tear down a connection after the client went away.
    pub async fn unregister(&self, id: &str) -> bool {
        self.close(id, CloseReason::ClientInitiated).await
    }

    /// Tear down a connection with an explicit close reason.
    ///
    /// Idempotent. The connection disappears from the registry and the
    /// subscription index immediately; the session is then signalled and
    /// given `teardown_grace` to exit before its state is abandoned.
    /// Returns `false` if the connection was not registered.
    pub async fn close(&self, id: &str, reason: CloseReason) -> bool {
        let Some(conn) = self.connections.write().remove(id) else {
            return false;
        };

        conn.begin_draining(reason);
        let removed = self.subscriptions.unsubscribe_all(id);

        if !conn.wait_finished(self.config.teardown_grace).await {
            warn!(
                connection_id = %id,
                grace_ms = self.config.teardown_grace.as_millis() as u64,
                "Session did not exit in time, abandoning"
            );
        }
        conn.mark_closed();

        let reason = conn.close_reason().unwrap_or(reason);
        if reason == CloseReason::HeartbeatTimeout {
            self.stats.write().heartbeat_evictions += 1;
        }
        self.metrics.connection_closed(id, reason);

        info!(
            connection_id = %id,
            reason = %reason,
            subscriptions = removed,
            "Connection closed"
        );
        true
    }

    /// Close every connection with [`CloseReason::ServerShutdown`].
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.read().keys().cloned().collect();
        let count = ids.len();
        let closes = ids
            .iter()
            .map(|id| self.close(id, CloseReason::ServerShutdown));
        futures::future::join_all(closes).await;
        info!(connections = count, "All connections closed for shutdown");
        count
    }

    /// Subscribe a connection to event types.
    ///
    /// The requested clusters are narrowed to the identity's cluster scope.
    /// Returns the confirmed event types and cluster filter.
    pub fn subscribe(
        &self,
        conn: &Connection,
        events: Vec<EventType>,
        clusters: Vec<String>,
    ) -> Result<(Vec<EventType>, BTreeSet<String>)> {
        if !conn.is_open() {
            return Err(HubError::ConnectionNotFound(conn.id.clone()));
        }
        let requested: BTreeSet<String> = clusters.into_iter().collect();
        let clusters = conn
            .identity
            .clusters
            .narrow(&requested)
            .map_err(HubError::ClusterNotPermitted)?;

        let added =
            self.subscriptions
                .subscribe_many(&conn.id, &events, ClusterFilter::from(clusters.clone()))?;
        // close() marks the connection draining before clearing the index, so
        // an insert that raced it is visible here.
        if !conn.is_open() {
            self.subscriptions.unsubscribe_all(&conn.id);
            return Err(HubError::ConnectionNotFound(conn.id.clone()));
        }
        if added > 0 {
            self.stats.write().total_subscriptions += added as u64;
        }

        debug!(
            connection_id = %conn.id,
            events = ?events,
            clusters = ?clusters,
            "Subscribed"
        );
        Ok((events, clusters))
    }

    /// Unsubscribe a connection from event types.
    pub fn unsubscribe(&self, conn: &Connection, events: &[EventType]) -> usize {
        let removed = events
            .iter()
            .filter(|event_type| self.subscriptions.unsubscribe(&conn.id, event_type))
            .count();
        debug!(connection_id = %conn.id, events = ?events, removed = removed, "Unsubscribed");
        removed
    }

    /// Account for a routed event.
    pub fn record_routed(&self, report: &RouteReport) {
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            stats.total_delivered += report.delivered as u64;
            stats.total_dropped += report.dropped as u64;
        }
        self.metrics.event_routed(report);
    }

    /// Current connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Per-connection metrics snapshot.
    pub fn connection_metrics(&self) -> Vec<ConnectionMetrics> {
        self.connections().iter().map(|c| c.metrics()).collect()
    }

    /// Hub statistics.
    pub fn stats(&self) -> HubStats {
        let mut stats = self.stats.read().clone();
        stats.current_connections = self.connection_count();
        stats.current_subscriptions = self.subscriptions.len();
        stats
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Current number of connections.
    pub current_connections: usize,
    /// Current number of subscriptions.
    pub current_subscriptions: usize,
    /// Total connections since start.
    pub total_connections: u64,
    /// Total subscriptions since start.
    pub total_subscriptions: u64,
    /// Total events routed since start.
    pub total_events: u64,
    /// Total payloads enqueued into buffers.
    pub total_delivered: u64,
    /// Total payloads dropped by drop-oldest.
    pub total_dropped: u64,
    /// Connections evicted by the heartbeat monitor.
    pub heartbeat_evictions: u64,
}
