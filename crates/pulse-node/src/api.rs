//! HTTP API for the Pulse node.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pulse_auth::{AuthError, SharedAuthenticator};
use pulse_realtime::{ConnectionRegistry, HubError, IngestHandle};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::health::{health_routes, HealthState};
use crate::observability::{metrics_handler, metrics_middleware, request_id_middleware, MetricsState};
use crate::realtime_api::realtime_routes;

/// How the WebSocket endpoint authenticates clients.
#[derive(Debug, Clone, Default)]
pub struct HandshakePolicy {
    /// Shared secret for trusted-proxy mode. When set, a request carrying
    /// the gateway's identity header is accepted if the secret matches.
    pub trusted_proxy_secret: Option<String>,
    /// Accept `?access_token=` as a credential.
    pub allow_query_token: bool,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry of the running hub.
    pub registry: Arc<ConnectionRegistry>,
    /// Event ingest handle.
    pub ingest: IngestHandle,
    /// Credential validator.
    pub authenticator: SharedAuthenticator,
    /// Handshake settings.
    pub handshake: HandshakePolicy,
    /// Prometheus metrics.
    pub metrics: MetricsState,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u32),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::UnsupportedProtocol(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(AuthError::MissingScope(_)) => StatusCode::FORBIDDEN,
            ApiError::Unauthorized(AuthError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Hub(HubError::IngestFull | HubError::IngestClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Hub(HubError::CapacityExceeded(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Hub(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Creates the API router.
pub fn create_router(state: AppState, health: HealthState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .merge(realtime_routes())
        .route("/metrics", get(metrics_handler).with_state(metrics.clone()))
        .with_state(state)
        .merge(health_routes(health))
        .layer(axum::middleware::from_fn_with_state(metrics, metrics_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
