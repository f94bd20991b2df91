//! # Observability Module
//!
//! Observability for the Pulse node:
//!
//! - **Structured Logging**: JSON or pretty logs with request IDs
//! - **Prometheus Metrics**: HTTP metrics plus the hub's connection, routing
//!   and heartbeat metrics
//! - **Request Tracing**: request ID propagation on every HTTP request
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use pulse_node::observability::{init_logging, metrics_middleware, request_id_middleware, MetricsState};
//!
//! init_logging("info", true);
//!
//! let metrics = MetricsState::new();
//!
//! let app: Router<()> = Router::new()
//!     .layer(axum::middleware::from_fn_with_state(metrics, metrics_middleware))
//!     .layer(axum::middleware::from_fn(request_id_middleware));
//! ```

mod logging;
mod metrics;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::MetricsState;
pub use middleware::{
    metrics_handler, metrics_middleware, request_id_middleware, RequestId, REQUEST_ID_HEADER,
};
