//! Identity and credential validation for Pulse.
//!
//! This crate provides:
//! - **Identities**: authenticated subjects with scopes and a cluster scope
//! - **Credentials**: bearer token extraction from WebSocket handshakes
//! - **Authenticator**: the async boundary to the identity service
//! - **StaticTokenAuthenticator**: an in-memory token table for development
//! - **TokenConfig**: the configuration-file form of a static token
//!
//! # Example
//!
//! ```
//! use pulse_auth::{Authenticator, Credential, Identity, StaticTokenAuthenticator};
//!
//! # tokio_test_block(async {
//! let auth = StaticTokenAuthenticator::new();
//! auth.insert("s3cret", Identity::new("dashboard").with_scope("events:read")).unwrap();
//!
//! let credential = Credential::extract(Some("Bearer s3cret"), None).unwrap();
//! let identity = auth.validate(&credential).await.unwrap();
//! assert_eq!(identity.subject, "dashboard");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod authenticator;
pub mod config;
pub mod credential;
pub mod error;
pub mod identity;

pub use authenticator::{Authenticator, SharedAuthenticator, StaticTokenAuthenticator};
pub use config::TokenConfig;
pub use credential::{
    secrets_match, Credential, BEARER_SUBPROTOCOL, IDENTITY_HEADER, PROXY_SECRET_HEADER,
};
pub use error::{AuthError, Result};
pub use identity::{ClusterScope, Identity, ADMIN_SCOPE, EVENTS_READ_SCOPE};
