//! Serde form of static token tables, as read from configuration files.

use crate::authenticator::StaticTokenAuthenticator;
use crate::error::Result;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A static token and the identity it maps to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
pub struct TokenConfig {
    #[validate(length(min = 8))]
    pub token: String,
    #[validate(length(min = 1))]
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Clusters the token may observe; empty means all.
    #[serde(default)]
    pub clusters: Vec<String>,
    /// Unix timestamp (seconds) after which the token is rejected.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TokenConfig {
    /// The identity this token authenticates as.
    pub fn identity(&self) -> Identity {
        let identity = self
            .scopes
            .iter()
            .fold(Identity::new(&self.subject), |id, scope| id.with_scope(scope));
        if self.clusters.is_empty() {
            identity
        } else {
            identity.with_clusters(self.clusters.iter().cloned())
        }
    }
}

impl StaticTokenAuthenticator {
    /// Build an authenticator from configured tokens.
    pub fn from_tokens(tokens: &[TokenConfig]) -> Result<Self> {
        let authenticator = Self::new();
        for entry in tokens {
            authenticator.insert_with_expiry(&entry.token, entry.identity(), entry.expires_at)?;
        }
        Ok(authenticator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Authenticator, AuthError, Credential};

    fn token(token: &str, subject: &str) -> TokenConfig {
        TokenConfig {
            token: token.into(),
            subject: subject.into(),
            scopes: vec!["events:read".into()],
            clusters: vec!["prod-eu".into()],
            expires_at: None,
        }
    }

    #[test]
    fn test_token_identity() {
        let identity = token("dashboard-token", "dashboard").identity();
        assert!(identity.has_scope("events:read"));
        assert!(identity.clusters.allows("prod-eu"));
        assert!(!identity.clusters.allows("prod-us"));
    }

    #[test]
    fn test_token_validation() {
        assert!(token("dashboard-token", "dashboard").validate().is_ok());
        assert!(token("short", "dashboard").validate().is_err());
        assert!(token("dashboard-token", "").validate().is_err());
    }

    #[tokio::test]
    async fn test_from_tokens() {
        let mut expired = token("expired-token", "old");
        expired.expires_at = Some(1);
        let auth =
            StaticTokenAuthenticator::from_tokens(&[token("dashboard-token", "dashboard"), expired])
                .unwrap();
        assert_eq!(auth.len(), 2);

        let identity = auth
            .validate(&Credential::new("dashboard-token"))
            .await
            .unwrap();
        assert_eq!(identity.subject, "dashboard");
        assert!(matches!(
            auth.validate(&Credential::new("expired-token")).await,
            Err(AuthError::Expired)
        ));
    }
}
