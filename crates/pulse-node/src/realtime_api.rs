//! Real-time WebSocket API and event ingest.
//!
//! - `/ws` - Hub WebSocket endpoint
//! - `/api/events` - Event ingest (single event or array)
//! - `/api/realtime/stats` - Hub statistics
//! - `/api/realtime/connections` - Per-connection metrics
//!
//! ## Handshake
//!
//! Clients authenticate with `Authorization: Bearer <token>`, the
//! `Sec-WebSocket-Protocol: bearer, <token>` pair, or (when enabled)
//! `?access_token=<token>`. Behind the gateway the node trusts the forwarded
//! identity header when the shared proxy secret matches. `?protocol=<n>`
//! selects the protocol version.

use axum::{
    extract::{
        ws::{self, rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{
        header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use pulse_auth::{
    secrets_match, AuthError, Credential, Identity, ADMIN_SCOPE, BEARER_SUBPROTOCOL,
    EVENTS_READ_SCOPE, IDENTITY_HEADER, PROXY_SECRET_HEADER,
};
use pulse_realtime::{
    CloseFrame, CloseReason, ConnectionMetrics, Event, EventType, Frame, HubError, Session,
    DEFAULT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AppState};

/// Create the real-time API routes.
pub fn realtime_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/events", post(ingest_events))
        .route("/api/realtime/stats", get(get_stats))
        .route("/api/realtime/connections", get(list_connections))
}

/// Query parameters accepted by `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Requested protocol version.
    pub protocol: Option<u32>,
    /// Credential passed in the query string.
    pub access_token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Protocol and credential presence are checked before the upgrade so a
/// client without credentials gets a plain HTTP 401. A presented but
/// rejected credential is upgraded and immediately closed with
/// `authentication_failed`.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let version = params.protocol.unwrap_or(DEFAULT_PROTOCOL_VERSION);
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
        debug!(version = version, "Rejected unsupported protocol version");
        return ApiError::UnsupportedProtocol(version).into_response();
    }

    let outcome = authenticate(&state, &headers, &params).await;
    match outcome {
        Err(AuthError::MissingCredential) => {
            return ApiError::Unauthorized(AuthError::MissingCredential).into_response();
        }
        Err(AuthError::Unavailable(reason)) => {
            return ApiError::Unauthorized(AuthError::Unavailable(reason)).into_response();
        }
        _ => {}
    }

    let ws = match ws {
        Ok(ws) => ws.protocols([BEARER_SUBPROTOCOL]),
        Err(rejection) => return rejection.into_response(),
    };

    match outcome {
        Ok(identity) => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity, version))
        }
        Err(e) => {
            warn!(error = %e, "WebSocket authentication failed");
            ws.on_upgrade(|socket| close_socket(socket, CloseReason::AuthenticationFailed))
        }
    }
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl axum::http::header::AsHeaderName,
) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the identity behind a handshake.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    params: &WsParams,
) -> Result<Identity, AuthError> {
    if let Some(expected) = &state.handshake.trusted_proxy_secret {
        if let Some(presented) = header_str(headers, PROXY_SECRET_HEADER) {
            if !secrets_match(presented, expected) {
                return Err(AuthError::InvalidCredential);
            }
            let value = header_str(headers, IDENTITY_HEADER).ok_or(AuthError::InvalidCredential)?;
            let identity = Identity::from_header_value(value)?;
            identity.require_scope(EVENTS_READ_SCOPE)?;
            return Ok(identity);
        }
    }

    let credential = Credential::extract(
        header_str(headers, AUTHORIZATION),
        header_str(headers, SEC_WEBSOCKET_PROTOCOL),
    )
    .or_else(|| {
        params
            .access_token
            .as_deref()
            .filter(|_| state.handshake.allow_query_token)
            .map(Credential::new)
    })
    .ok_or(AuthError::MissingCredential)?;

    let identity = state.authenticator.validate(&credential).await?;
    identity.require_scope(EVENTS_READ_SCOPE)?;
    Ok(identity)
}

/// Validate the `Authorization` header and require the admin scope.
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let credential = header_str(headers, AUTHORIZATION)
        .and_then(Credential::from_authorization)
        .ok_or(AuthError::MissingCredential)?;
    let identity = state.authenticator.validate(&credential).await?;
    identity.require_scope(ADMIN_SCOPE)?;
    Ok(identity)
}

/// Drive an authenticated WebSocket through a hub session.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity, version: u32) {
    let subject = identity.subject.clone();
    let conn = match state.registry.register(identity, version) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(subject = %subject, error = %e, "Rejecting WebSocket client");
            close_socket(socket, CloseReason::CapacityExceeded).await;
            return;
        }
    };

    let connection_id = conn.id.clone();
    info!(connection_id = %connection_id, subject = %subject, "WebSocket client connected");

    let (sink, stream) = socket.split();
    let sink =
        sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(frame_to_message(frame))));
    let stream = stream.map(|message| message.map(message_to_frame));

    let reason = Session::new(state.registry.clone(), conn).run(sink, stream).await;
    info!(connection_id = %connection_id, reason = %reason, "WebSocket client disconnected");
}

/// Close a socket that never became a hub connection.
async fn close_socket(mut socket: WebSocket, reason: CloseReason) {
    let frame = reason.frame();
    let close = Message::Close(Some(ws::CloseFrame {
        code: frame.code,
        reason: frame.reason.into(),
    }));
    if let Err(e) = socket.send(close).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.to_string().into()),
        Frame::Close(frame) => Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code,
            reason: f.reason.into(),
        })),
        Frame::Other => Message::Ping(Default::default()),
    }
}

fn message_to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::text(text.as_str()),
        Message::Close(frame) => Frame::Close(frame.map(|f| CloseFrame {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        })),
        _ => Frame::Other,
    }
}

/// An event submitted to the ingest endpoint.
#[derive(Debug, Deserialize)]
pub struct EventInput {
    pub event_type: EventType,
    pub cluster_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to the time of ingest.
    pub produced_at: Option<u64>,
}

impl EventInput {
    fn into_event(self) -> Result<Event, ApiError> {
        if self.event_type.as_str().is_empty() {
            return Err(ApiError::BadRequest("event_type cannot be empty".into()));
        }
        if self.cluster_id.is_empty() {
            return Err(ApiError::BadRequest("cluster_id cannot be empty".into()));
        }
        let mut event = Event::new(self.event_type, self.cluster_id, self.payload);
        if let Some(produced_at) = self.produced_at {
            event.produced_at = produced_at;
        }
        Ok(event)
    }
}

/// Ingest request body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch(Vec<EventInput>),
    Single(EventInput),
}

/// Ingest response.
#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
    rejected: usize,
}

/// Submit events to the hub.
async fn ingest_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;

    let inputs = match request {
        IngestRequest::Batch(inputs) => inputs,
        IngestRequest::Single(input) => vec![input],
    };
    if inputs.is_empty() {
        return Err(ApiError::BadRequest("no events submitted".into()));
    }
    let events = inputs
        .into_iter()
        .map(EventInput::into_event)
        .collect::<Result<Vec<_>, _>>()?;

    let total = events.len();
    let mut accepted = 0;
    for event in events {
        match state.ingest.publish(event) {
            Ok(()) => accepted += 1,
            Err(HubError::IngestFull) if accepted > 0 => break,
            Err(e) => return Err(e.into()),
        }
    }

    if accepted < total {
        warn!(accepted = accepted, total = total, "Ingest queue full, batch truncated");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted,
            rejected: total - accepted,
        }),
    ))
}

/// Get hub statistics.
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats())
}

/// Per-connection metrics as exposed over HTTP.
#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub subject: String,
    pub state: String,
    pub created_at: u64,
    pub buffer_depth: usize,
    pub buffer_capacity: usize,
    pub dropped: u64,
    pub avg_latency_ms: f64,
    pub paused: bool,
    pub missed_pongs: u32,
}

impl From<ConnectionMetrics> for ConnectionInfo {
    fn from(m: ConnectionMetrics) -> Self {
        Self {
            id: m.id,
            subject: m.subject,
            state: m.state.to_string(),
            created_at: m.created_at,
            buffer_depth: m.buffer.depth,
            buffer_capacity: m.buffer.capacity,
            dropped: m.buffer.dropped,
            avg_latency_ms: m.buffer.avg_latency.as_secs_f64() * 1000.0,
            paused: m.buffer.paused,
            missed_pongs: m.missed_pongs,
        }
    }
}

/// List live connections. Requires the admin scope.
async fn list_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let connections: Vec<ConnectionInfo> = state
        .registry
        .connection_metrics()
        .into_iter()
        .map(ConnectionInfo::from)
        .collect();
    Ok(Json(connections))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_conversion() {
        let message = frame_to_message(Frame::text(r#"{"type":"ping","timestamp":1}"#));
        assert!(matches!(&message, Message::Text(t) if t.as_str().contains("ping")));

        let message = frame_to_message(Frame::Close(Some(CloseReason::ServerShutdown.frame())));
        match message {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason.as_str(), "server_shutdown");
            }
            other => panic!("unexpected message {:?}", other),
        }

        assert_eq!(message_to_frame(Message::Text("hi".into())), Frame::text("hi"));
        assert_eq!(message_to_frame(Message::Binary(Default::default())), Frame::Other);
        assert_eq!(message_to_frame(Message::Close(None)), Frame::Close(None));
    }

    #[test]
    fn test_ingest_request_shapes() {
        let single: IngestRequest =
            serde_json::from_str(r#"{"event_type":"alert","cluster_id":"c1"}"#).unwrap();
        assert!(matches!(single, IngestRequest::Single(_)));

        let batch: IngestRequest = serde_json::from_str(
            r#"[{"event_type":"alert","cluster_id":"c1"},{"event_type":"status","cluster_id":"c2","payload":{"up":true}}]"#,
        )
        .unwrap();
        assert!(matches!(batch, IngestRequest::Batch(ref v) if v.len() == 2));
    }

    #[test]
    fn test_event_input_validation() {
        let input = EventInput {
            event_type: EventType::new("alert"),
            cluster_id: String::new(),
            payload: serde_json::Value::Null,
            produced_at: None,
        };
        assert!(matches!(input.into_event(), Err(ApiError::BadRequest(_))));

        let input = EventInput {
            event_type: EventType::new("alert"),
            cluster_id: "c1".into(),
            payload: serde_json::Value::Null,
            produced_at: Some(42),
        };
        assert_eq!(input.into_event().unwrap().produced_at, 42);
    }
}
