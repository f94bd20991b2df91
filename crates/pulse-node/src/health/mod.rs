//! # Health Check Module
//!
//! - **Liveness Probe**: is the process running?
//! - **Readiness Probe**: is the hub accepting connections?
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use pulse_node::health::{health_routes, HealthState};
//!
//! let health_state = HealthState::new(registry.clone());
//! health_state.set_ready(true);
//!
//! let app: Router<()> = Router::new()
//!     .merge(health_routes(health_state));
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pulse_realtime::ConnectionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy.
    Up,
    /// Component is unhealthy.
    Down,
}

/// Individual component health.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component status.
    pub status: HealthStatus,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Liveness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Component health checks.
    pub checks: ReadinessChecks,
}

/// Readiness component checks.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    /// Connection hub health.
    pub hub: ComponentHealth,
}

/// Overall health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Version info.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Component checks.
    pub checks: ReadinessChecks,
}

/// Health state shared by the probe handlers.
#[derive(Clone)]
pub struct HealthState {
    /// When the service started.
    start_time: Instant,
    /// Whether the service is ready.
    ready: Arc<AtomicBool>,
    registry: Arc<ConnectionRegistry>,
}

impl HealthState {
    /// Create a health state over the hub registry. Starts not ready.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            registry,
        }
    }

    /// Get uptime in seconds.
    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Set readiness state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if service is ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn hub_health(&self) -> ComponentHealth {
        let connections = self.registry.connection_count();
        let max = self.registry.config().max_connections;
        let status = if self.is_ready() && connections < max {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };
        ComponentHealth {
            status,
            details: Some(serde_json::json!({
                "connections": connections,
                "max_connections": max,
            })),
        }
    }

    fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            hub: self.hub_health(),
        }
    }
}

/// Create health check routes.
pub fn health_routes<S>(state: HealthState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Up => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Overall health handler.
async fn health_handler(State(state): State<HealthState>) -> Response {
    let checks = state.readiness_checks();
    let status = checks.hub.status;

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
        checks,
    };

    (status_code(status), Json(response)).into_response()
}

/// Liveness probe handler.
async fn liveness_handler(State(state): State<HealthState>) -> Response {
    let response = LivenessResponse {
        status: HealthStatus::Up,
        uptime_seconds: state.uptime(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness probe handler.
async fn readiness_handler(State(state): State<HealthState>) -> Response {
    let checks = state.readiness_checks();
    let status = checks.hub.status;
    (status_code(status), Json(ReadinessResponse { status, checks })).into_response()
}
