//! Leadership change notification
//!
//! Subscribers are called synchronously, in subscription order, with every
//! change of resolved leader. Deliveries are serialized so a listener never
//! runs concurrently with itself, and a listener removed with
//! [`LeadershipNotifier::unsubscribe`] receives nothing afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Payload delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipChange {
    pub system: String,
    /// Hostname of the new leader
    pub leader: String,
    /// Whether the receiving node is the new leader
    pub is_self: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&LeadershipChange) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
}

/// Observer list for leadership changes
#[derive(Clone, Default)]
pub struct LeadershipNotifier {
    subscribers: Arc<Mutex<Subscribers>>,
    delivery: Arc<Mutex<()>>,
}

impl LeadershipNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&LeadershipChange) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.next_id += 1;
        let id = SubscriptionId(subscribers.next_id);
        subscribers.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.listeners.len();
        subscribers.listeners.retain(|(sid, _)| *sid != id);
        subscribers.listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .listeners
            .len()
    }

    /// Deliver `change` to every current subscriber. Returns how many were called.
    pub fn notify(&self, change: &LeadershipChange) -> usize {
        let _delivery = self
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut delivered = 0;
        let mut index = 0;
        // Listeners are looked up one at a time so an unsubscribe made by an
        // earlier listener takes effect within the same delivery.
        while let Some((id, listener)) = self.listener_after(index) {
            index = id.0;
            listener(change);
            delivered += 1;
        }
        delivered
    }

    fn listener_after(&self, after: u64) -> Option<(SubscriptionId, Listener)> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .listeners
            .iter()
            .find(|(id, _)| id.0 > after)
            .map(|(id, listener)| (*id, listener.clone()))
    }
}

impl std::fmt::Debug for LeadershipNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
