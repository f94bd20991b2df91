//! Subscription index mapping event types to interested connections.

use crate::config::DEFAULT_MAX_SUBSCRIPTIONS;
use crate::connection::ConnectionId;
use crate::error::HubError;
use crate::event::{Event, EventType};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Cluster filter of a subscription. Empty means every cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterFilter(BTreeSet<String>);

impl ClusterFilter {
    /// Match events from every cluster.
    pub fn all() -> Self {
        Self(BTreeSet::new())
    }

    /// Match events from the listed clusters only.
    pub fn only<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(clusters.into_iter().map(Into::into).collect())
    }

    /// Whether an event from this cluster matches.
    pub fn matches(&self, cluster_id: &str) -> bool {
        self.0.is_empty() || self.0.contains(cluster_id)
    }

    /// Whether the filter accepts every cluster.
    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    /// The filtered clusters.
    pub fn clusters(&self) -> &BTreeSet<String> {
        &self.0
    }
}

impl From<BTreeSet<String>> for ClusterFilter {
    fn from(set: BTreeSet<String>) -> Self {
        Self(set)
    }
}

/// A single (connection, event type) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribing connection.
    pub connection_id: ConnectionId,
    /// Subscribed event type.
    pub event_type: EventType,
    /// Cluster filter.
    pub filter: ClusterFilter,
}

#[derive(Debug, Default)]
struct IndexInner {
    /// Event type -> interested connections and their filters.
    by_type: HashMap<EventType, HashMap<ConnectionId, ClusterFilter>>,
    /// Connection -> subscribed event types, for cap checks and teardown.
    by_connection: HashMap<ConnectionId, HashSet<EventType>>,
}

impl IndexInner {
    fn insert(&mut self, connection_id: &ConnectionId, event_type: &EventType, filter: ClusterFilter) -> bool {
        self.by_type
            .entry(event_type.clone())
            .or_default()
            .insert(connection_id.clone(), filter);
        self.by_connection
            .entry(connection_id.clone())
            .or_default()
            .insert(event_type.clone())
    }

    fn remove(&mut self, connection_id: &str, event_type: &EventType) -> bool {
        let removed = match self.by_type.get_mut(event_type) {
            Some(subscribers) => {
                let removed = subscribers.remove(connection_id).is_some();
                if subscribers.is_empty() {
                    self.by_type.remove(event_type);
                }
                removed
            }
            None => false,
        };
        if let Some(types) = self.by_connection.get_mut(connection_id) {
            types.remove(event_type);
            if types.is_empty() {
                self.by_connection.remove(connection_id);
            }
        }
        removed
    }

    fn count_for(&self, connection_id: &str) -> usize {
        self.by_connection.get(connection_id).map_or(0, HashSet::len)
    }
}

/// Index answering "which connections want this event".
///
/// Lookups cost time proportional to the number of connections subscribed to
/// the event's type, not the total number of connections.
#[derive(Debug)]
pub struct SubscriptionIndex {
    max_per_connection: usize,
    inner: RwLock<IndexInner>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIPTIONS)
    }
}

impl SubscriptionIndex {
    /// Create an index with a per-connection subscription cap.
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            max_per_connection,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Per-connection subscription cap.
    pub fn max_per_connection(&self) -> usize {
        self.max_per_connection
    }

    /// Subscribe a connection to an event type, replacing any existing filter.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        event_type: &EventType,
        filter: ClusterFilter,
    ) -> Result<bool, HubError> {
        self.subscribe_many(connection_id, std::slice::from_ref(event_type), filter)
            .map(|added| added == 1)
    }

    /// Subscribe a connection to several event types with one filter.
    ///
    /// Either every type is (up)serted or, if the cap would be exceeded,
    /// nothing changes. Returns the number of new subscriptions.
    pub fn subscribe_many(
        &self,
        connection_id: &ConnectionId,
        event_types: &[EventType],
        filter: ClusterFilter,
    ) -> Result<usize, HubError> {
        let mut inner = self.inner.write();

        let existing = inner.by_connection.get(connection_id);
        let new_types: HashSet<&EventType> = event_types
            .iter()
            .filter(|t| existing.map_or(true, |set| !set.contains(*t)))
            .collect();

        if inner.count_for(connection_id) + new_types.len() > self.max_per_connection {
            return Err(HubError::SubscriptionLimitExceeded(self.max_per_connection));
        }

        let mut added = 0;
        for event_type in event_types {
            if inner.insert(connection_id, event_type, filter.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, connection_id: &str, event_type: &EventType) -> bool {
        self.inner.write().remove(connection_id, event_type)
    }

    /// Remove every subscription of a connection. Returns how many were removed.
    pub fn unsubscribe_all(&self, connection_id: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(types) = inner.by_connection.remove(connection_id) else {
            return 0;
        };
        for event_type in &types {
            if let Some(subscribers) = inner.by_type.get_mut(event_type) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    inner.by_type.remove(event_type);
                }
            }
        }
        types.len()
    }

    /// Connections whose subscriptions match the event.
    pub fn match_event(&self, event: &Event) -> Vec<ConnectionId> {
        let inner = self.inner.read();
        inner
            .by_type
            .get(&event.event_type)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, filter)| filter.matches(&event.cluster_id))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscriptions held by a connection.
    pub fn subscriptions_for(&self, connection_id: &str) -> Vec<Subscription> {
        let inner = self.inner.read();
        let Some(types) = inner.by_connection.get(connection_id) else {
            return Vec::new();
        };
        types
            .iter()
            .filter_map(|event_type| {
                let filter = inner.by_type.get(event_type)?.get(connection_id)?;
                Some(Subscription {
                    connection_id: connection_id.to_string(),
                    event_type: event_type.clone(),
                    filter: filter.clone(),
                })
            })
            .collect()
    }

    /// Number of subscriptions held by a connection.
    pub fn count_for(&self, connection_id: &str) -> usize {
        self.inner.read().count_for(connection_id)
    }

    /// Whether any entry references the connection.
    pub fn references(&self, connection_id: &str) -> bool {
        let inner = self.inner.read();
        inner.by_connection.contains_key(connection_id)
            || inner
                .by_type
                .values()
                .any(|subscribers| subscribers.contains_key(connection_id))
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.inner.read().by_connection.values().map(HashSet::len).sum()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_connection.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> ConnectionId {
        s.to_string()
    }

    fn alert(cluster: &str) -> Event {
        Event::new(EventType::ALERT, cluster, serde_json::Value::Null)
    }

    #[test]
    fn test_cluster_filter() {
        assert!(ClusterFilter::all().matches("anything"));
        let filter = ClusterFilter::only(["c1", "c2"]);
        assert!(filter.matches("c1"));
        assert!(!filter.matches("c3"));
        assert!(!filter.is_all());
    }

    #[test]
    fn test_subscribe_and_match() {
        let index = SubscriptionIndex::default();
        let alert_type = EventType::new(EventType::ALERT);

        assert!(index.subscribe(&id("a"), &alert_type, ClusterFilter::all()).unwrap());
        assert!(index.subscribe(&id("b"), &alert_type, ClusterFilter::only(["c1"])).unwrap());

        let mut matched = index.match_event(&alert("c1"));
        matched.sort();
        assert_eq!(matched, vec![id("a"), id("b")]);

        assert_eq!(index.match_event(&alert("c2")), vec![id("a")]);

        let status = Event::new(EventType::STATUS, "c1", serde_json::Value::Null);
        assert!(index.match_event(&status).is_empty());
    }

    #[test]
    fn test_repeat_subscribe_replaces_filter() {
        let index = SubscriptionIndex::default();
        let alert_type = EventType::new(EventType::ALERT);

        assert!(index.subscribe(&id("a"), &alert_type, ClusterFilter::only(["c1"])).unwrap());
        assert!(!index.subscribe(&id("a"), &alert_type, ClusterFilter::only(["c2"])).unwrap());

        assert_eq!(index.count_for("a"), 1);
        assert!(index.match_event(&alert("c1")).is_empty());
        assert_eq!(index.match_event(&alert("c2")), vec![id("a")]);
    }

    #[test]
    fn test_unsubscribe() {
        let index = SubscriptionIndex::default();
        let alert_type = EventType::new(EventType::ALERT);

        index.subscribe(&id("a"), &alert_type, ClusterFilter::all()).unwrap();
        assert!(index.unsubscribe("a", &alert_type));
        assert!(!index.unsubscribe("a", &alert_type));
        assert!(index.match_event(&alert("c1")).is_empty());
        assert!(!index.references("a"));
    }

    #[test]
    fn test_unsubscribe_all() {
        let index = SubscriptionIndex::default();
        let types: Vec<EventType> = ["alert", "status", "anomaly"].into_iter().map(EventType::new).collect();
        index.subscribe_many(&id("a"), &types, ClusterFilter::all()).unwrap();
        index.subscribe_many(&id("b"), &types[..1], ClusterFilter::all()).unwrap();

        assert_eq!(index.unsubscribe_all("a"), 3);
        assert_eq!(index.unsubscribe_all("a"), 0);
        assert!(!index.references("a"));
        assert_eq!(index.match_event(&alert("c1")), vec![id("b")]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_subscription_limit() {
        let index = SubscriptionIndex::new(3);
        let types: Vec<EventType> = (0..3).map(|i| EventType::new(format!("t{}", i))).collect();
        assert_eq!(index.subscribe_many(&id("a"), &types, ClusterFilter::all()).unwrap(), 3);

        // Upserting an existing type does not count against the cap
        assert!(index.subscribe(&id("a"), &types[0], ClusterFilter::only(["c9"])).is_ok());

        let extra = EventType::new("extra");
        assert!(matches!(
            index.subscribe(&id("a"), &extra, ClusterFilter::all()),
            Err(HubError::SubscriptionLimitExceeded(3))
        ));
        assert_eq!(index.count_for("a"), 3);
    }

    #[test]
    fn test_subscribe_many_is_atomic() {
        let index = SubscriptionIndex::new(2);
        let types: Vec<EventType> = (0..3).map(|i| EventType::new(format!("t{}", i))).collect();
        assert!(index.subscribe_many(&id("a"), &types, ClusterFilter::all()).is_err());
        assert_eq!(index.count_for("a"), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_subscriptions_for() {
        let index = SubscriptionIndex::default();
        index
            .subscribe(&id("a"), &EventType::new("alert"), ClusterFilter::only(["c1"]))
            .unwrap();
        let subs = index.subscriptions_for("a");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].event_type.as_str(), "alert");
        assert!(subs[0].filter.matches("c1"));
        assert!(index.subscriptions_for("missing").is_empty());
    }

    proptest! {
        /// Property: empty filters always match, non-empty filters match exactly their members
        #[test]
        fn prop_match_respects_filter(
            filter in prop::collection::btree_set("c[0-9]", 0..5),
            cluster in "c[0-9]",
        ) {
            let index = SubscriptionIndex::default();
            let alert_type = EventType::new(EventType::ALERT);
            index.subscribe(&id("conn"), &alert_type, ClusterFilter::from(filter.clone())).unwrap();

            let matched = index.match_event(&alert(&cluster));
            let expected = filter.is_empty() || filter.contains(&cluster);
            prop_assert_eq!(matched.contains(&id("conn")), expected);
        }
    }
}
