//! # Pulse Gateway
//!
//! Authenticating WebSocket proxy in front of a Pulse hub.
//!
//! Clients connect to the gateway with the same credentials they would
//! present to the hub. The gateway validates them, then opens its own
//! connection to the hub in trusted-proxy mode, forwarding the validated
//! identity and a shared secret, and relays frames both ways.
//!
//! Rejections follow the hub's conventions:
//!
//! | Situation | Result |
//! |-----------|--------|
//! | no credential | HTTP 401 before upgrade |
//! | rejected credential | upgrade, close 1008 `authentication_failed` |
//! | hub unreachable | upgrade, close 1011 `server_unavailable` |
//! | gateway shutting down | close 1001 `server_shutdown` |

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;

pub use config::{ConfigError, GatewayConfig};
pub use error::ProxyError;
pub use proxy::{connect_upstream, create_router, GatewayState, Upstream};
