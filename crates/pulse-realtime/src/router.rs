//! Event fan-out from the ingest point into connection buffers.

use crate::error::{HubError, Result};
use crate::event::Event;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Connections whose subscriptions matched.
    pub matched: usize,
    /// Buffers the event was enqueued into.
    pub delivered: usize,
    /// Enqueues that displaced an older payload.
    pub dropped: usize,
    /// Matched connections that were torn down before enqueue.
    pub skipped: usize,
}

/// Producer side of the ingest channel.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Event>,
}

impl IngestHandle {
    /// Submit an event without waiting. Fails when the channel is full.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::IngestFull,
            mpsc::error::TrySendError::Closed(_) => HubError::IngestClosed,
        })
    }

    /// Submit an event, waiting for channel capacity.
    pub async fn publish_wait(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| HubError::IngestClosed)
    }
}

/// Create a bounded ingest channel.
pub fn ingest_channel(capacity: usize) -> (IngestHandle, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestHandle { tx }, rx)
}

/// Routes events to subscribed connections.
#[derive(Debug, Clone)]
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
}

impl EventRouter {
    /// Create a router over a registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Fan an event out to every matching connection.
    ///
    /// Never blocks on a single connection: enqueue is non-blocking and a
    /// connection that disappeared after matching is skipped.
    pub fn route(&self, event: &Event) -> RouteReport {
        let targets = self.registry.subscriptions().match_event(event);
        let mut report = RouteReport {
            matched: targets.len(),
            ..Default::default()
        };

        if !targets.is_empty() {
            let payload = match event.to_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, event_type = %event.event_type, "Failed to serialize event");
                    return report;
                }
            };

            let sink = self.registry.metrics_sink();
            for id in &targets {
                let outcome = self
                    .registry
                    .get(id)
                    .and_then(|conn| conn.enqueue(payload.clone()));
                match outcome {
                    Some(outcome) => {
                        report.delivered += 1;
                        if !outcome.accepted {
                            report.dropped += 1;
                        }
                        if let Some(transition) = outcome.transition {
                            sink.watermark_crossed(id, transition);
                        }
                    }
                    None => report.skipped += 1,
                }
            }
        }

        self.registry.record_routed(&report);

        debug!(
            event_type = %event.event_type,
            cluster_id = %event.cluster_id,
            matched = report.matched,
            delivered = report.delivered,
            dropped = report.dropped,
            "Event routed"
        );
        report
    }

    /// Consume the ingest channel until it closes or `shutdown` fires.
    pub async fn run(self, mut events: mpsc::Receiver<Event>, shutdown: CancellationToken) {
        info!("Event router started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => {
                        self.route(&event);
                    }
                    None => break,
                },
            }
        }
        info!("Event router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, HubConfig};
    use crate::event::EventType;
    use pulse_auth::Identity;

    fn setup(capacity: usize) -> (Arc<ConnectionRegistry>, EventRouter) {
        let registry = Arc::new(ConnectionRegistry::new(HubConfig {
            buffer: BufferConfig::with_capacity(capacity),
            ..Default::default()
        }));
        let router = EventRouter::new(registry.clone());
        (registry, router)
    }

    fn alert(cluster: &str) -> Event {
        Event::new(EventType::ALERT, cluster, serde_json::json!({"severity": "warning"}))
    }

    #[tokio::test]
    async fn test_cluster_filter_scenario() {
        let (registry, router) = setup(10);
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        registry
            .subscribe(&conn, vec![EventType::new("alert")], vec!["c1".into()])
            .unwrap();

        let report = router.route(&alert("c2"));
        assert_eq!(report.matched, 0);
        assert!(conn.buffer().is_empty());

        let report = router.route(&alert("c1"));
        assert_eq!(report.delivered, 1);
        assert_eq!(conn.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_many() {
        let (registry, router) = setup(10);
        let conns: Vec<_> = (0..50)
            .map(|i| {
                let conn = registry.register(Identity::new(format!("user{}", i)), 1).unwrap();
                registry
                    .subscribe(&conn, vec![EventType::new("alert")], vec![])
                    .unwrap();
                conn
            })
            .collect();

        let report = router.route(&alert("c1"));
        assert_eq!(report.matched, 50);
        assert_eq!(report.delivered, 50);
        for conn in &conns {
            assert_eq!(conn.buffer().len(), 1);
        }
        assert_eq!(registry.stats().total_delivered, 50);
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_without_affecting_others() {
        let (registry, router) = setup(3);
        let slow = registry.register(Identity::new("slow"), 1).unwrap();
        let fast = registry.register(Identity::new("fast"), 1).unwrap();
        for conn in [&slow, &fast] {
            registry
                .subscribe(conn, vec![EventType::new("alert")], vec![])
                .unwrap();
        }

        let mut fast_received = 0;
        for _ in 0..10 {
            router.route(&alert("c1"));
            while fast.dequeue().is_some() {
                fast_received += 1;
            }
        }

        assert_eq!(fast_received, 10);
        assert_eq!(slow.buffer().len(), 3);
        assert_eq!(slow.buffer().dropped(), 7);
        assert_eq!(registry.stats().total_dropped, 7);
    }

    #[tokio::test]
    async fn test_draining_connection_is_skipped() {
        let (registry, router) = setup(10);
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        registry
            .subscribe(&conn, vec![EventType::new("alert")], vec![])
            .unwrap();

        // Close requested but index entry still present
        conn.begin_draining(crate::protocol::CloseReason::ClientInitiated);
        let report = router.route(&alert("c1"));
        assert_eq!(report.matched, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_run_consumes_ingest() {
        let (registry, router) = setup(10);
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        registry
            .subscribe(&conn, vec![EventType::new("alert")], vec![])
            .unwrap();

        let (ingest, rx) = ingest_channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(router.run(rx, shutdown.clone()));

        ingest.publish(alert("c1")).unwrap();
        ingest.publish_wait(alert("c2")).await.unwrap();
        drop(ingest);
        task.await.unwrap();

        assert_eq!(conn.buffer().len(), 2);
        assert_eq!(registry.stats().total_events, 2);
    }

    #[tokio::test]
    async fn test_publish_full_and_closed() {
        let (ingest, rx) = ingest_channel(1);
        ingest.publish(alert("c1")).unwrap();
        assert!(matches!(ingest.publish(alert("c1")), Err(HubError::IngestFull)));
        drop(rx);
        assert!(matches!(ingest.publish(alert("c1")), Err(HubError::IngestClosed)));
    }
}
