//! Wire protocol between clients and the hub.
//!
//! Control messages are JSON text frames tagged by `type`.

use crate::connection::ConnectionId;
use crate::error::HubError;
use crate::event::{now_millis, EventType, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Answer to a hub ping.
    Pong,
    /// Subscribe to event types, optionally restricted to clusters.
    Subscribe {
        events: Vec<EventType>,
        #[serde(default)]
        clusters: Vec<String>,
    },
    /// Drop subscriptions for event types.
    Unsubscribe { events: Vec<EventType> },
}

impl ClientCommand {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::MalformedControlMessage(e.to_string()))
    }
}

/// Messages the hub sends besides event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the connection is registered.
    Welcome {
        connection_id: ConnectionId,
        protocol_version: u32,
    },
    /// Liveness probe; the client must answer with `pong`.
    Ping { timestamp: u64 },
    /// Subscription confirmed.
    Subscribed {
        events: Vec<EventType>,
        clusters: Vec<String>,
    },
    /// Unsubscription confirmed.
    Unsubscribed { events: Vec<EventType> },
    /// A control message was rejected.
    Error { code: String, message: String },
}

impl ServerMessage {
    /// A ping stamped with the current time.
    pub fn ping() -> Self {
        ServerMessage::Ping {
            timestamp: now_millis(),
        }
    }

    /// An error reply built from a hub error.
    pub fn error(err: &HubError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Serialize to a text payload.
    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// A close frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket close code.
    pub code: u16,
    /// Machine-readable reason.
    pub reason: String,
}

/// A transport frame, independent of the WebSocket library in use.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A UTF-8 text frame.
    Text(Payload),
    /// A close frame.
    Close(Option<CloseFrame>),
    /// Any other frame (binary, transport-level ping/pong); ignored by the hub.
    Other,
}

impl Frame {
    /// Build a text frame.
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        Frame::Text(s.into())
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The handshake credential was rejected.
    AuthenticationFailed,
    /// The client stopped answering pings.
    HeartbeatTimeout,
    /// The hub is shutting down.
    ServerShutdown,
    /// The client closed the connection or the transport failed.
    ClientInitiated,
    /// The registry had no room for the connection.
    CapacityExceeded,
    /// The upstream hub could not be reached (gateway only).
    ServerUnavailable,
}

impl CloseReason {
    /// WebSocket close code.
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::AuthenticationFailed | CloseReason::HeartbeatTimeout => 1008,
            CloseReason::ServerShutdown => 1001,
            CloseReason::ClientInitiated => 1000,
            CloseReason::CapacityExceeded => 1013,
            CloseReason::ServerUnavailable => 1011,
        }
    }

    /// Machine-readable reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AuthenticationFailed => "authentication_failed",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::ClientInitiated => "client_closed",
            CloseReason::CapacityExceeded => "capacity_exceeded",
            CloseReason::ServerUnavailable => "server_unavailable",
        }
    }

    /// The close frame announcing this reason.
    pub fn frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: self.as_str().to_string(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
