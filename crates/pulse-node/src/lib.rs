//! # Pulse Node
//!
//! Server binary library for the Pulse event hub.
//!
//! A node hosts one hub and exposes it over HTTP: the WebSocket endpoint
//! that dashboards and CLI clients connect to, an ingest endpoint for
//! producers, hub statistics, health probes and Prometheus metrics.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Pulse Node                       │
//! ├───────────────────────────────────────────────────────┤
//! │  HTTP API Layer                                       │
//! │  • /ws           WebSocket sessions                   │
//! │  • /api/events   event ingest                         │
//! │  • /api/realtime hub stats and connections            │
//! │  • /health       liveness and readiness               │
//! │  • /metrics      Prometheus exposition                │
//! ├───────────────────────────────────────────────────────┤
//! │  Hub (pulse-realtime)                                 │
//! │  • registry, buffers, router, heartbeat monitor       │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin pulse-node -- --listen-addr 127.0.0.1:8080
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Router assembly, shared state and API errors
//! - [`realtime_api`] - WebSocket handshake, ingest and stats endpoints
//! - [`config`] - Layered configuration (file, environment)
//! - [`observability`] - Structured logging, metrics, and request tracing
//! - [`health`] - Health check endpoints (liveness, readiness)

pub mod api;
pub mod config;
pub mod health;
pub mod observability;
pub mod realtime_api;
