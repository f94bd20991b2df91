//! # Pulse Real-time
//!
//! Connection hub for the Pulse event distribution layer.
//!
//! Dashboard and CLI clients hold long-lived WebSocket connections and receive
//! status changes, alerts, telemetry and anomalies as they are produced. This
//! crate keeps those connections alive, subscribed and fed without letting one
//! slow client stall the others.
//!
//! ## Features
//!
//! - **Connection Registry**: single owner of connection lifecycle
//! - **Message Buffer**: bounded drop-oldest queue with watermarks
//! - **Heartbeat Monitor**: application-level ping/pong liveness
//! - **Subscription Index**: event type and cluster filtering
//! - **Event Router**: fan-out from the ingest channel into buffers
//! - **Session**: receive and send loops over any frame stream/sink
//!
//! ## Example
//!
//! ```rust
//! use pulse_auth::Identity;
//! use pulse_realtime::{ConnectionRegistry, Event, EventRouter, EventType, HubConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ConnectionRegistry::new(HubConfig::default()));
//! let conn = registry.register(Identity::new("dashboard"), 1).unwrap();
//!
//! registry
//!     .subscribe(&conn, vec![EventType::new("alert")], vec!["prod-eu".into()])
//!     .unwrap();
//!
//! let router = EventRouter::new(registry.clone());
//! let report = router.route(&Event::new("alert", "prod-eu", serde_json::json!({"severity": "critical"})));
//! assert_eq!(report.delivered, 1);
//! assert_eq!(conn.buffer().len(), 1);
//! ```
//!
//! ## WebSocket Protocol
//!
//! ### Client -> Server Messages
//!
//! ```json
//! {"type": "subscribe", "events": ["alert", "status"], "clusters": ["prod-eu"]}
//! {"type": "unsubscribe", "events": ["status"]}
//! {"type": "pong"}
//! ```
//!
//! ### Server -> Client Messages
//!
//! ```json
//! {"type": "welcome", "connection_id": "...", "protocol_version": 1}
//! {"type": "ping", "timestamp": 1700000000000}
//! {"type": "subscribed", "events": ["alert"], "clusters": ["prod-eu"]}
//! {"type": "event", "event_type": "alert", "cluster_id": "prod-eu", "payload": {}, "produced_at": 1700000000000}
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ingest ──► EventRouter ──► SubscriptionIndex::match_event
//!                  │
//!                  ▼
//!        ConnectionRegistry ── Connection ── MessageBuffer ──► send loop ──► client
//!                  ▲                │
//!        HeartbeatMonitor           └── control queue (ping, acks)
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod subscription;

// Re-export main types
pub use buffer::{BufferMetrics, DropPolicy, EnqueueOutcome, MessageBuffer, WatermarkTransition};
pub use config::{
    BufferConfig, HeartbeatConfig, HubConfig, DEFAULT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use connection::{Connection, ConnectionId, ConnectionMetrics, ConnectionState};
pub use error::{HubError, Result};
pub use event::{Event, EventType, Payload};
pub use heartbeat::{HeartbeatMonitor, HeartbeatState, TickAction, TickReport};
pub use hub::Hub;
pub use metrics::{MetricsSink, NoopMetrics, SharedMetricsSink};
pub use protocol::{ClientCommand, CloseFrame, CloseReason, Frame, ServerMessage};
pub use registry::{ConnectionRegistry, HubStats};
pub use router::{ingest_channel, EventRouter, IngestHandle, RouteReport};
pub use session::Session;
pub use subscription::{ClusterFilter, Subscription, SubscriptionIndex};
