//! Authenticated identities and their authorization scope.

use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Scope required to open an event stream.
pub const EVENTS_READ_SCOPE: &str = "events:read";

/// Scope granting administrative operations (e.g. forced disconnects).
pub const ADMIN_SCOPE: &str = "hub:admin";

/// An identity returned by an [`Authenticator`](crate::Authenticator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (user or service account).
    pub subject: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Clusters this identity may observe.
    #[serde(default)]
    pub clusters: ClusterScope,
}

impl Identity {
    /// Create an identity with no scopes and access to every cluster.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: None,
            scopes: BTreeSet::new(),
            clusters: ClusterScope::All,
        }
    }

    /// Add a scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.insert(scope.into());
        self
    }

    /// Restrict the identity to a set of clusters.
    pub fn with_clusters<I, S>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clusters = ClusterScope::Only(clusters.into_iter().map(Into::into).collect());
        self
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Check whether a scope was granted.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains(ADMIN_SCOPE)
    }

    /// Fail with [`AuthError::MissingScope`] unless the scope was granted.
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::MissingScope(scope.to_string()))
        }
    }

    /// Encode the identity for forwarding in a trusted header.
    pub fn to_header_value(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AuthError::InvalidInput(e.to_string()))
    }

    /// Decode an identity forwarded by a trusted proxy.
    pub fn from_header_value(value: &str) -> Result<Self> {
        let identity: Identity =
            serde_json::from_str(value).map_err(|e| AuthError::InvalidInput(e.to_string()))?;
        if identity.subject.is_empty() {
            return Err(AuthError::InvalidInput("empty subject".into()));
        }
        Ok(identity)
    }
}

/// The set of clusters an identity is allowed to observe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterScope {
    /// Every cluster.
    #[default]
    All,
    /// Only the listed clusters.
    Only(BTreeSet<String>),
}

impl ClusterScope {
    /// Check whether a cluster is visible.
    pub fn allows(&self, cluster: &str) -> bool {
        match self {
            ClusterScope::All => true,
            ClusterScope::Only(set) => set.contains(cluster),
        }
    }

    /// Resolve a requested cluster filter against this scope.
    ///
    /// An empty request means "every cluster I may see". Requests naming a
    /// cluster outside the scope fail with the first offending cluster id.
    pub fn narrow(&self, requested: &BTreeSet<String>) -> std::result::Result<BTreeSet<String>, String> {
        match self {
            ClusterScope::All => Ok(requested.clone()),
            ClusterScope::Only(allowed) => {
                if requested.is_empty() {
                    return Ok(allowed.clone());
                }
                match requested.iter().find(|c| !allowed.contains(*c)) {
                    Some(denied) => Err(denied.clone()),
                    None => Ok(requested.clone()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identity_scopes() {
        let identity = Identity::new("alice").with_scope(EVENTS_READ_SCOPE);
        assert!(identity.has_scope(EVENTS_READ_SCOPE));
        assert!(!identity.has_scope("events:write"));
        assert!(identity.require_scope("events:write").is_err());
    }

    #[test]
    fn test_admin_implies_every_scope() {
        let identity = Identity::new("root").with_scope(ADMIN_SCOPE);
        assert!(identity.has_scope(EVENTS_READ_SCOPE));
    }

    #[test]
    fn test_cluster_scope_all() {
        let scope = ClusterScope::All;
        assert!(scope.allows("anything"));
        assert_eq!(scope.narrow(&set(&[])).unwrap(), set(&[]));
        assert_eq!(scope.narrow(&set(&["c1"])).unwrap(), set(&["c1"]));
    }

    #[test]
    fn test_cluster_scope_only() {
        let scope = ClusterScope::Only(set(&["c1", "c2"]));
        assert!(scope.allows("c1"));
        assert!(!scope.allows("c3"));

        // Empty request widens to the whole allowed set
        assert_eq!(scope.narrow(&set(&[])).unwrap(), set(&["c1", "c2"]));
        assert_eq!(scope.narrow(&set(&["c2"])).unwrap(), set(&["c2"]));
        assert_eq!(scope.narrow(&set(&["c2", "c3"])).unwrap_err(), "c3");
    }

    #[test]
    fn test_header_value_roundtrip() {
        let identity = Identity::new("svc-dashboard")
            .with_scope(EVENTS_READ_SCOPE)
            .with_clusters(["prod-eu"]);
        let header = identity.to_header_value().unwrap();
        let decoded = Identity::from_header_value(&header).unwrap();
        assert_eq!(decoded, identity);
    }

    #[test]
    fn test_header_value_rejects_garbage() {
        assert!(Identity::from_header_value("not json").is_err());
        assert!(Identity::from_header_value(r#"{"subject":""}"#).is_err());
    }
}
