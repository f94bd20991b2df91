//! Events produced by upstream collectors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A serialized message ready to be written to a client.
///
/// Shared between every buffer an event is fanned out to.
pub type Payload = Arc<str>;

/// The kind of an event (`alert`, `status`, `telemetry`, `anomaly`, ...).
///
/// The hub does not validate event types; any non-empty name is routable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Cluster or component status change.
    pub const STATUS: &'static str = "status";
    /// Alert fired or resolved.
    pub const ALERT: &'static str = "alert";
    /// Telemetry update.
    pub const TELEMETRY: &'static str = "telemetry";
    /// Detected anomaly.
    pub const ANOMALY: &'static str = "anomaly";

    /// Create an event type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An event flowing from the ingest point to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    pub event_type: EventType,
    /// Cluster the event originated from.
    pub cluster_id: String,
    /// Producer-defined payload, routed without inspection.
    pub payload: serde_json::Value,
    /// Unix timestamp (milliseconds) when the event was produced.
    pub produced_at: u64,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        event_type: impl Into<EventType>,
        cluster_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            cluster_id: cluster_id.into(),
            payload,
            produced_at: now_millis(),
        }
    }

    /// Serialize the client-facing envelope.
    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        let envelope = EventEnvelope {
            kind: "event",
            event_type: &self.event_type,
            cluster_id: &self.cluster_id,
            payload: &self.payload,
            produced_at: self.produced_at,
        };
        Ok(Arc::from(serde_json::to_string(&envelope)?))
    }
}

/// Wire form of an event as delivered to clients.
#[derive(Serialize)]
struct EventEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event_type: &'a EventType,
    cluster_id: &'a str,
    payload: &'a serde_json::Value,
    produced_at: u64,
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
