//! Gateway errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pulse_auth::AuthError;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while admitting or relaying a client.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client handshake was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// The hub could not be reached.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The hub refused the forwarded handshake.
    #[error("upstream rejected handshake with status {0}")]
    UpstreamRejected(u16),

    /// The forwarded identity could not be encoded as a header.
    #[error("invalid forwarded header: {0}")]
    InvalidHeader(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Unauthorized(AuthError::MissingScope(_)) => StatusCode::FORBIDDEN,
            ProxyError::Unauthorized(AuthError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamUnavailable(_) | ProxyError::UpstreamRejected(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::InvalidHeader(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
