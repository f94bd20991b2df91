//! The authenticator boundary and an in-memory token implementation.

use crate::credential::Credential;
use crate::error::{AuthError, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Validates bearer credentials against an identity service.
///
/// The hub never inspects credentials itself; every handshake goes through
/// an implementation of this trait.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate a credential and return the identity it belongs to.
    async fn validate(&self, credential: &Credential) -> Result<Identity>;
}

/// Shared authenticator handle.
pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// A registered token.
#[derive(Debug, Clone)]
struct TokenEntry {
    identity: Identity,
    /// Unix timestamp (seconds) after which the token is rejected.
    expires_at: Option<u64>,
}

/// Thread-safe in-memory token table.
///
/// Tokens are stored as SHA-256 digests, so the raw secrets are never kept
/// in memory after registration.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    /// Token digests (hex) to identities.
    tokens: RwLock<HashMap<String, TokenEntry>>,
}

impl StaticTokenAuthenticator {
    /// Create an empty authenticator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for an identity.
    pub fn insert(&self, token: &str, identity: Identity) -> Result<()> {
        self.insert_with_expiry(token, identity, None)
    }

    /// Register a token that expires at the given Unix timestamp.
    pub fn insert_with_expiry(
        &self,
        token: &str,
        identity: Identity,
        expires_at: Option<u64>,
    ) -> Result<()> {
        if token.trim().is_empty() {
            return Err(AuthError::InvalidInput("token cannot be empty".into()));
        }
        if identity.subject.is_empty() {
            return Err(AuthError::InvalidInput("subject cannot be empty".into()));
        }
        self.tokens.write().insert(
            digest(token),
            TokenEntry {
                identity,
                expires_at,
            },
        );
        Ok(())
    }

    /// Revoke a token. Returns whether it was registered.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(&digest(token)).is_some()
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn validate(&self, credential: &Credential) -> Result<Identity> {
        let entry = self
            .tokens
            .read()
            .get(&digest(credential.token()))
            .cloned()
            .ok_or(AuthError::InvalidCredential)?;

        if let Some(expires_at) = entry.expires_at {
            if now_secs() >= expires_at {
                tracing::debug!(subject = %entry.identity.subject, "Rejected expired token");
                return Err(AuthError::Expired);
            }
        }

        Ok(entry.identity)
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
