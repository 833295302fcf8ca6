//! Topic matching and subscription management
//!
//! Implements topic name/filter validation, the topic filter matcher and
//! the subscription registry that resolves a published topic to the
//! connections that should receive it.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{matches, validate_topic_filter, validate_topic_name, TopicLevel};

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::broker::ConnectionId;
use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Owning connection
    pub connection: ConnectionId,
    /// Client ID of the owning connection (for logging)
    pub client_id: Arc<str>,
    /// QoS the subscriber asked for
    pub requested_qos: QoS,
    /// QoS the broker granted (never above the requested one)
    pub granted_qos: QoS,
}

/// Subscription errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// Filter violates wildcard placement rules
    InvalidFilter(&'static str),
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::InvalidFilter(reason) => write!(f, "invalid topic filter: {}", reason),
        }
    }
}

impl std::error::Error for SubscribeError {}

/// Thread-safe subscription registry using a topic trie
///
/// Holds at most one subscription per (connection, exact filter string);
/// subscribing again replaces the entry in place.
pub struct SubscriptionRegistry {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
    max_qos: QoS,
}

impl SubscriptionRegistry {
    /// Create a registry granting at most `max_qos`
    pub fn new(max_qos: QoS) -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            max_qos,
        }
    }

    /// Highest QoS this registry grants
    pub fn max_qos(&self) -> QoS {
        self.max_qos
    }

    /// Add or replace a subscription, returning the granted QoS
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        client_id: &Arc<str>,
        filter: &str,
        requested_qos: QoS,
    ) -> Result<QoS, SubscribeError> {
        validate_topic_filter(filter).map_err(SubscribeError::InvalidFilter)?;

        let granted_qos = requested_qos.min(self.max_qos);
        let subscription = Subscription {
            connection,
            client_id: client_id.clone(),
            requested_qos,
            granted_qos,
        };

        let mut trie = self.trie.write();
        let subs = trie.get_or_insert_with(filter, Vec::new);
        match subs.iter_mut().find(|s| s.connection == connection) {
            Some(existing) => *existing = subscription,
            None => subs.push(subscription),
        }

        Ok(granted_qos)
    }

    /// Remove a subscription; returns whether one existed
    pub fn unsubscribe(&self, connection: ConnectionId, filter: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| s.connection != connection);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove every subscription owned by a connection (idempotent)
    pub fn remove_all(&self, connection: ConnectionId) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.connection != connection);
            subs.is_empty()
        });
    }

    /// Visit each (connection, granted QoS) pair whose filter matches `topic`
    ///
    /// The callback runs under the registry read lock; it must not call back
    /// into the registry.
    pub fn for_each_match<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Subscription),
    {
        let trie = self.trie.read();
        trie.matches(topic, |subs| {
            for sub in subs {
                callback(sub);
            }
        });
    }

    /// Collect the (connection, granted QoS) pairs matching `topic`
    ///
    /// A connection with several overlapping filters appears once per
    /// matching filter. Order is stable for an unchanged registry.
    pub fn matching_subscribers(&self, topic: &str) -> SmallVec<[(ConnectionId, QoS); 16]> {
        let mut result = SmallVec::new();
        self.for_each_match(topic, |sub| result.push((sub.connection, sub.granted_qos)));
        result
    }

    /// Whether no subscriptions are registered
    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}
