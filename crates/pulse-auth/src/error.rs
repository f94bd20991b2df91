//! Error types for the auth crate.

use thiserror::Error;

/// Errors returned while validating a connection credential.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented in the handshake.
    #[error("missing credential")]
    MissingCredential,

    /// The credential is unknown or malformed.
    #[error("invalid credential")]
    InvalidCredential,

    /// The credential was valid but has expired.
    #[error("credential expired")]
    Expired,

    /// The identity lacks a scope required by the caller.
    #[error("missing scope: {0}")]
    MissingScope(String),

    /// The identity service could not be reached.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
