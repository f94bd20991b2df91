//! Live client connections.

use crate::buffer::{BufferMetrics, Dequeued, EnqueueOutcome, MessageBuffer};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::event::{now_millis, Payload};
use crate::heartbeat::{HeartbeatState, TickAction};
use crate::protocol::{CloseReason, ServerMessage};
use parking_lot::Mutex;
use pulse_auth::Identity;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Lifecycle state of a connection.
///
/// `Connecting → Active → (Paused ⇄ Active) → Draining → Closed`. A failed
/// handshake goes from `Connecting` straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake and authentication in progress; no hub state allocated.
    Connecting,
    /// Registered and receiving events.
    Active,
    /// Buffer above the high watermark. Advisory only.
    Paused,
    /// Close requested; loops are flushing and exiting.
    Draining,
    /// Torn down.
    Closed,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Draining)
                | (Paused, Draining)
                | (Draining, Closed)
        )
    }

    /// Whether the connection is registered and not closing.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Paused)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Paused => "paused",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_DRAINING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// Point-in-time view of a connection for observability.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Connection id.
    pub id: ConnectionId,
    /// Owning subject.
    pub subject: String,
    /// Current state.
    pub state: ConnectionState,
    /// Unix timestamp (milliseconds) of registration.
    pub created_at: u64,
    /// Buffer metrics.
    pub buffer: BufferMetrics,
    /// Consecutive unanswered pings.
    pub missed_pongs: u32,
}

/// A registered client connection.
///
/// Owned by the [`ConnectionRegistry`](crate::ConnectionRegistry); sessions,
/// the router and the heartbeat monitor hold `Arc`s only while working on it.
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Authenticated owner.
    pub identity: Identity,
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Unix timestamp (milliseconds) of registration.
    pub created_at: u64,
    lifecycle: AtomicU8,
    buffer: MessageBuffer,
    heartbeat: Mutex<HeartbeatState>,
    /// Priority queue for hub control messages (pings, acks).
    control_tx: mpsc::Sender<Payload>,
    control_rx: Mutex<Option<mpsc::Receiver<Payload>>>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancelled when a close is requested.
    cancel: CancellationToken,
    /// Cancelled once both session loops have exited.
    finished: CancellationToken,
    session_attached: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subject", &self.identity.subject)
            .field("protocol_version", &self.protocol_version)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a new active connection.
    pub fn new(id: ConnectionId, identity: Identity, protocol_version: u32, config: &HubConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity.max(1));
        Self {
            id,
            identity,
            protocol_version,
            created_at: now_millis(),
            lifecycle: AtomicU8::new(LIFECYCLE_OPEN),
            buffer: MessageBuffer::new(config.buffer),
            heartbeat: Mutex::new(HeartbeatState::new()),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            session_attached: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_OPEN if self.buffer.is_paused() => ConnectionState::Paused,
            LIFECYCLE_OPEN => ConnectionState::Active,
            LIFECYCLE_DRAINING => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection accepts events.
    pub fn is_open(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == LIFECYCLE_OPEN
    }

    /// The connection's buffer.
    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// Queue an event payload. Returns `None` if the connection is closing.
    pub fn enqueue(&self, payload: Payload) -> Option<EnqueueOutcome> {
        if !self.is_open() {
            return None;
        }
        let outcome = self.buffer.enqueue(payload);
        if outcome.transition.is_some() {
            tracing::debug!(
                connection_id = %self.id,
                depth = self.buffer.len(),
                "Connection paused at high watermark"
            );
        }
        Some(outcome)
    }

    /// Take the oldest queued payload.
    pub fn dequeue(&self) -> Option<Dequeued> {
        let dequeued = self.buffer.dequeue()?;
        if dequeued.transition.is_some() {
            tracing::debug!(
                connection_id = %self.id,
                depth = self.buffer.len(),
                "Connection resumed at low watermark"
            );
        }
        Some(dequeued)
    }

    /// Queue a control message ahead of buffered events.
    ///
    /// Fails when the send loop is gone or not keeping up with control
    /// traffic; callers treat that as a broken transport.
    pub fn send_control(&self, message: &ServerMessage) -> Result<(), HubError> {
        let payload = message.to_payload()?;
        self.control_tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Transport("control queue full".into()),
            mpsc::error::TrySendError::Closed(_) => HubError::Transport("send loop closed".into()),
        })
    }

    /// Hand the control queue receiver to the send loop. Only succeeds once.
    pub fn take_control_receiver(&self) -> Option<mpsc::Receiver<Payload>> {
        self.control_rx.lock().take()
    }

    /// Record a pong from the client.
    pub fn record_pong(&self, now: Instant) {
        self.heartbeat.lock().record_pong(now);
    }

    /// Advance the heartbeat state for a monitor tick.
    pub fn heartbeat_tick(&self, now: Instant, config: &crate::config::HeartbeatConfig) -> TickAction {
        self.heartbeat.lock().on_tick(now, config)
    }

    /// Mark the heartbeat as failed (e.g. ping could not be sent).
    pub fn mark_dead(&self) {
        self.heartbeat.lock().mark_dead();
    }

    /// Snapshot of the heartbeat state.
    pub fn heartbeat(&self) -> HeartbeatState {
        self.heartbeat.lock().clone()
    }

    /// Request a close. Returns `true` if this call started draining.
    pub fn begin_draining(&self, reason: CloseReason) -> bool {
        let started = self
            .lifecycle
            .compare_exchange(
                LIFECYCLE_OPEN,
                LIFECYCLE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started {
            self.close_reason.lock().get_or_insert(reason);
        }
        self.cancel.cancel();
        started
    }

    /// Mark the connection fully closed.
    pub fn mark_closed(&self) {
        self.lifecycle.store(LIFECYCLE_CLOSED, Ordering::Release);
        self.cancel.cancel();
    }

    /// The reason the connection is closing, if a close was requested.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once a close has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Whether a close has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the connection for a session. Returns `false` if already claimed.
    pub fn attach_session(&self) -> bool {
        !self.session_attached.swap(true, Ordering::AcqRel)
    }

    /// Signal that both session loops have exited.
    pub fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Wait for the session loops to exit, up to `grace`.
    ///
    /// Returns `true` when no session is attached or it finished in time.
    pub async fn wait_finished(&self, grace: Duration) -> bool {
        if !self.session_attached.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(grace, self.finished.cancelled())
            .await
            .is_ok()
    }

    /// Snapshot for observability.
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            id: self.id.clone(),
            subject: self.identity.subject.clone(),
            state: self.state(),
            created_at: self.created_at,
            buffer: self.buffer.metrics(),
            missed_pongs: self.heartbeat.lock().missed_pongs(),
        }
    }
}
