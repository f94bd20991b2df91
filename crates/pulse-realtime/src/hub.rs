//! The running hub: registry plus its background tasks.

use crate::config::HubConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{NoopMetrics, SharedMetricsSink};
use crate::registry::ConnectionRegistry;
use crate::router::{ingest_channel, EventRouter, IngestHandle};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A started hub.
///
/// Owns the router and heartbeat tasks. Cloning the registry or ingest
/// handle out of it is how the embedding server talks to the hub.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    ingest: IngestHandle,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Hub {
    /// Start a hub that discards metrics.
    pub fn start(config: HubConfig) -> Self {
        Self::start_with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Start a hub reporting to `metrics`.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_with_metrics(config: HubConfig, metrics: SharedMetricsSink) -> Self {
        let ingest_capacity = config.ingest_capacity;
        let registry = Arc::new(ConnectionRegistry::with_metrics(config, metrics));
        let (ingest, events) = ingest_channel(ingest_capacity);
        let shutdown = CancellationToken::new();

        let router = EventRouter::new(registry.clone());
        let monitor = HeartbeatMonitor::new(registry.clone());
        let tasks = vec![
            tokio::spawn(router.run(events, shutdown.child_token())),
            tokio::spawn(monitor.run(shutdown.child_token())),
        ];

        info!(
            max_connections = registry.config().max_connections,
            buffer_capacity = registry.config().buffer.capacity,
            "Hub started"
        );

        Self {
            registry,
            ingest,
            shutdown,
            tasks,
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle for submitting events.
    pub fn ingest(&self) -> &IngestHandle {
        &self.ingest
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background tasks and close every connection.
    ///
    /// Returns the number of connections closed.
    pub async fn shutdown(self) -> usize {
        info!("Hub shutting down");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Hub task failed");
            }
        }
        self.registry.shutdown().await
    }
}
