//! Error types for the hub.

use crate::connection::ConnectionId;
use thiserror::Error;

/// Errors that can occur in hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The handshake was rejected before any hub state was allocated.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] pulse_auth::AuthError),

    /// The registry refused a new connection.
    #[error("connection capacity exceeded: max {0} connections")]
    CapacityExceeded(usize),

    /// Per-connection subscription cap reached.
    #[error("subscription limit exceeded: max {0} subscriptions")]
    SubscriptionLimitExceeded(usize),

    /// The identity may not observe the requested cluster.
    #[error("cluster not permitted: {0}")]
    ClusterNotPermitted(String),

    /// The connection stopped answering pings.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Read or write failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A client control message could not be understood.
    #[error("malformed control message: {0}")]
    MalformedControlMessage(String),

    /// Connection not found.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The ingest channel has been closed.
    #[error("ingest channel closed")]
    IngestClosed,

    /// The ingest channel is full.
    #[error("ingest channel full")]
    IngestFull,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    /// Machine-readable error code sent to clients in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::AuthenticationFailed(_) => "authentication_failed",
            HubError::CapacityExceeded(_) => "capacity_exceeded",
            HubError::SubscriptionLimitExceeded(_) => "subscription_limit",
            HubError::ClusterNotPermitted(_) => "cluster_not_permitted",
            HubError::HeartbeatTimeout => "heartbeat_timeout",
            HubError::Transport(_) => "transport_error",
            HubError::MalformedControlMessage(_) => "malformed_message",
            HubError::ConnectionNotFound(_) => "connection_not_found",
            HubError::IngestClosed | HubError::IngestFull => "ingest_unavailable",
            HubError::Serialization(_) => "serialization_error",
        }
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
