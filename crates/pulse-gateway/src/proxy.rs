//! Authenticating WebSocket relay.
//!
//! The gateway validates the client's credential itself and opens a second
//! WebSocket to the hub carrying the validated identity and the shared proxy
//! secret. Frames are then relayed in both directions until either leg closes.
//!
//! ```text
//!  client ──ws──► gateway ──ws + x-pulse-identity──► hub
//! ```

use axum::{
    extract::{
        ws::{self, rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{
        header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
        HeaderMap,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use pulse_auth::{
    AuthError, Credential, Identity, SharedAuthenticator, BEARER_SUBPROTOCOL, EVENTS_READ_SCOPE,
    IDENTITY_HEADER, PROXY_SECRET_HEADER,
};
use pulse_realtime::CloseReason;
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::{frame::coding::CloseCode, CloseFrame as UpstreamCloseFrame},
    Message as UpstreamMessage,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ProxyError;

/// WebSocket connection to the hub.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to reach the hub.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Hub WebSocket endpoint.
    pub url: String,
    /// Shared secret forwarded with every handshake.
    pub proxy_secret: String,
    /// Bound on the upstream handshake.
    pub connect_timeout: Duration,
}

/// Gateway state shared across handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub authenticator: SharedAuthenticator,
    pub upstream: Arc<Upstream>,
    /// Accept `?access_token=` as a credential.
    pub allow_query_token: bool,
    /// Cancelled when the gateway shuts down; open relays close their clients.
    pub shutdown: CancellationToken,
    /// Tracks open relays so shutdown can wait for them.
    pub relays: TaskTracker,
}

impl GatewayState {
    pub fn new(
        authenticator: SharedAuthenticator,
        upstream: Upstream,
        allow_query_token: bool,
    ) -> Self {
        Self {
            authenticator,
            upstream: Arc::new(upstream),
            allow_query_token,
            shutdown: CancellationToken::new(),
            relays: TaskTracker::new(),
        }
    }

    /// Stop accepting relays, close the open ones and wait up to `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.relays.close();
        tokio::time::timeout(grace, self.relays.wait()).await.is_ok()
    }
}

/// Creates the gateway router.
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health/live", get(liveness))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn liveness(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "up",
        "relays": state.relays.len(),
    }))
}

/// Query parameters accepted by `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Requested protocol version, forwarded to the hub.
    pub protocol: Option<u32>,
    pub access_token: Option<String>,
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl axum::http::header::AsHeaderName,
) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn ws_handler(
    State(state): State<GatewayState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let credential = Credential::extract(
        header_str(&headers, AUTHORIZATION),
        header_str(&headers, SEC_WEBSOCKET_PROTOCOL),
    )
    .or_else(|| {
        params
            .access_token
            .as_deref()
            .filter(|_| state.allow_query_token)
            .map(Credential::new)
    });
    let Some(credential) = credential else {
        return ProxyError::Unauthorized(AuthError::MissingCredential).into_response();
    };

    let outcome = match state.authenticator.validate(&credential).await {
        Ok(identity) => identity.require_scope(EVENTS_READ_SCOPE).map(|()| identity),
        Err(e) => Err(e),
    };
    if let Err(AuthError::Unavailable(reason)) = outcome {
        return ProxyError::Unauthorized(AuthError::Unavailable(reason)).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws.protocols([BEARER_SUBPROTOCOL]),
        Err(rejection) => return rejection.into_response(),
    };

    match outcome {
        Ok(identity) => {
            let relays = state.relays.clone();
            ws.on_upgrade(move |socket| {
                relays.track_future(relay(socket, state, identity, params.protocol))
            })
        }
        Err(e) => {
            warn!(error = %e, "Gateway authentication failed");
            ws.on_upgrade(|socket| close_client(socket, CloseReason::AuthenticationFailed))
        }
    }
}

/// Open the hub leg for an authenticated client.
pub async fn connect_upstream(
    upstream: &Upstream,
    identity: &Identity,
    protocol: Option<u32>,
) -> Result<UpstreamSocket, ProxyError> {
    let url = match protocol {
        Some(version) => format!("{}?protocol={}", upstream.url, version),
        None => upstream.url.clone(),
    };
    let mut request = url
        .into_client_request()
        .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;

    let encoded = identity.to_header_value()?;
    let headers = request.headers_mut();
    headers.insert(
        IDENTITY_HEADER,
        HeaderValue::from_str(&encoded).map_err(|e| ProxyError::InvalidHeader(e.to_string()))?,
    );
    headers.insert(
        PROXY_SECRET_HEADER,
        HeaderValue::from_str(&upstream.proxy_secret)
            .map_err(|e| ProxyError::InvalidHeader(e.to_string()))?,
    );

    let connect = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(upstream.connect_timeout, connect).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(tungstenite::Error::Http(response))) => {
            Err(ProxyError::UpstreamRejected(response.status().as_u16()))
        }
        Ok(Err(e)) => Err(ProxyError::UpstreamUnavailable(e.to_string())),
        Err(_) => Err(ProxyError::UpstreamUnavailable("connect timed out".into())),
    }
}

/// Relay one client until either leg closes.
async fn relay(client: WebSocket, state: GatewayState, identity: Identity, protocol: Option<u32>) {
    let upstream = match connect_upstream(&state.upstream, &identity, protocol).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(subject = %identity.subject, error = %e, "Hub unreachable");
            close_client(client, CloseReason::ServerUnavailable).await;
            return;
        }
    };
    info!(subject = %identity.subject, "Relay opened");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let shutdown = state.shutdown.clone();
    let ended = tokio::select! {
        end = pump(&mut client_rx, &mut upstream_tx, client_to_upstream) => {
            RelayEnd::Pump(Leg::Client, end)
        }
        end = pump(&mut upstream_rx, &mut client_tx, upstream_to_client) => {
            RelayEnd::Pump(Leg::Hub, end)
        }
        _ = shutdown.cancelled() => RelayEnd::Shutdown,
    };

    if ended == RelayEnd::Shutdown {
        let _ = client_tx.send(shutdown_close()).await;
    }

    // Closing an already-closed leg is a no-op error.
    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
    info!(subject = %identity.subject, ended_by = ended.label(), "Relay closed");
}

/// Close frame sent to clients when the gateway stops.
fn shutdown_close() -> ws::Message {
    let frame = CloseReason::ServerShutdown.frame();
    ws::Message::Close(Some(ws::CloseFrame {
        code: frame.code,
        reason: frame.reason.into(),
    }))
}

/// Source side of a relay pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Client,
    Hub,
}

/// How one direction of the relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// A close frame was forwarded.
    Closed,
    /// The source stream ended or failed.
    SourceLost,
    /// The destination refused a frame.
    SinkLost,
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    Pump(Leg, PumpEnd),
    Shutdown,
}

impl RelayEnd {
    fn label(self) -> &'static str {
        match self {
            RelayEnd::Pump(Leg::Client, PumpEnd::Closed) => "client_close",
            RelayEnd::Pump(Leg::Hub, PumpEnd::Closed) => "hub_close",
            RelayEnd::Pump(Leg::Client, PumpEnd::SourceLost) => "client_lost",
            RelayEnd::Pump(Leg::Hub, PumpEnd::SourceLost) => "hub_lost",
            RelayEnd::Pump(Leg::Client, PumpEnd::SinkLost) => "hub_write_failed",
            RelayEnd::Pump(Leg::Hub, PumpEnd::SinkLost) => "client_write_failed",
            RelayEnd::Shutdown => "shutdown",
        }
    }
}

/// Forward frames from `source` to `sink` until a close frame passes or
/// either side fails.
async fn pump<A, B, E1, E2, Src, Dst>(
    source: &mut Src,
    sink: &mut Dst,
    convert: fn(A) -> Option<(B, bool)>,
) -> PumpEnd
where
    Src: Stream<Item = Result<A, E1>> + Unpin,
    Dst: Sink<B, Error = E2> + Unpin,
    E1: std::fmt::Display,
    E2: std::fmt::Display,
{
    while let Some(item) = source.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Relay source failed");
                return PumpEnd::SourceLost;
            }
        };
        let Some((message, is_close)) = convert(message) else {
            continue;
        };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Relay sink failed");
            return PumpEnd::SinkLost;
        }
        if is_close {
            return PumpEnd::Closed;
        }
    }
    PumpEnd::SourceLost
}

/// Convert a client frame for the hub. Transport pings stay on their leg.
fn client_to_upstream(message: ws::Message) -> Option<(UpstreamMessage, bool)> {
    match message {
        ws::Message::Text(text) => Some((UpstreamMessage::Text(text.as_str().to_owned()), false)),
        ws::Message::Binary(data) => Some((UpstreamMessage::Binary(data.to_vec()), false)),
        ws::Message::Close(frame) => Some((
            UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
                code: CloseCode::from(f.code),
                reason: Cow::Owned(f.reason.as_str().to_owned()),
            })),
            true,
        )),
        ws::Message::Ping(_) | ws::Message::Pong(_) => None,
    }
}

/// Convert a hub frame for the client.
fn upstream_to_client(message: UpstreamMessage) -> Option<(ws::Message, bool)> {
    match message {
        UpstreamMessage::Text(text) => Some((ws::Message::Text(text.into()), false)),
        UpstreamMessage::Binary(data) => Some((ws::Message::Binary(data.into()), false)),
        UpstreamMessage::Close(frame) => Some((
            ws::Message::Close(frame.map(|f| ws::CloseFrame {
                code: u16::from(f.code),
                reason: f.reason.into_owned().into(),
            })),
            true,
        )),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}

/// Close a client that never got an upstream leg.
async fn close_client(mut socket: WebSocket, reason: CloseReason) {
    let frame = reason.frame();
    let close = ws::Message::Close(Some(ws::CloseFrame {
        code: frame.code,
        reason: frame.reason.into(),
    }));
    if let Err(e) = socket.send(close).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
