//! Bearer credential extraction from connection handshakes.

use sha2::{Digest, Sha256};
use std::fmt;

/// Sub-protocol marker that precedes a token in `Sec-WebSocket-Protocol`.
pub const BEARER_SUBPROTOCOL: &str = "bearer";

/// Header carrying a proxy-validated identity as JSON.
pub const IDENTITY_HEADER: &str = "x-pulse-identity";

/// Header carrying the secret shared between the gateway and the hub.
pub const PROXY_SECRET_HEADER: &str = "x-pulse-proxy-secret";

/// Compare two shared secrets without short-circuiting on the first
/// differing byte.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// An opaque bearer credential.
///
/// The token is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Parse an `Authorization: Bearer <token>` header value.
    pub fn from_authorization(value: &str) -> Option<Self> {
        let (scheme, token) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then(|| Self::new(token))
    }

    /// Parse a `Sec-WebSocket-Protocol` value of the form `bearer, <token>`.
    pub fn from_subprotocols(value: &str) -> Option<Self> {
        let mut parts = value.split(',').map(str::trim);
        while let Some(part) = parts.next() {
            if part.eq_ignore_ascii_case(BEARER_SUBPROTOCOL) {
                return parts
                    .next()
                    .filter(|token| !token.is_empty())
                    .map(Self::new);
            }
        }
        None
    }

    /// Extract a credential from the handshake, preferring the
    /// `Authorization` header over the sub-protocol token.
    pub fn extract(authorization: Option<&str>, subprotocols: Option<&str>) -> Option<Self> {
        authorization
            .and_then(Self::from_authorization)
            .or_else(|| subprotocols.and_then(Self::from_subprotocols))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
