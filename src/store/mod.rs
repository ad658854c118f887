//! Coordination store contract
//!
//! The election core consumes a linearizable key-value service with:
//! - atomic put / get / delete and prefix range reads
//! - prefix watches pushing put/delete events, ordered per key
//! - TTL leases that delete their bound keys when not renewed in time
//!
//! Any backend satisfying [`CoordinationStore`] (etcd, Consul sessions, ...)
//! can be injected into a [`ClusterCoordinator`](crate::election::ClusterCoordinator).
//! [`MemoryStore`] is the in-process implementation used by tests and the
//! simulator.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::Result;

pub use memory::MemoryStore;

/// Handle on a TTL lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Handle on an open watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Put,
    Delete,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventKind::Put => write!(f, "put"),
            WatchEventKind::Delete => write!(f, "delete"),
        }
    }
}

/// One mutation observed by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value for puts, `None` for deletes
    pub value: Option<Bytes>,
    /// Store revision at which the mutation happened
    pub revision: u64,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: Bytes, revision: u64) -> Self {
        Self {
            kind: WatchEventKind::Put,
            key: key.into(),
            value: Some(value),
            revision,
        }
    }

    pub fn delete(key: impl Into<String>, revision: u64) -> Self {
        Self {
            kind: WatchEventKind::Delete,
            key: key.into(),
            value: None,
            revision,
        }
    }

    /// Value decoded as UTF-8, if present and valid
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Push stream of watch events. A terminal `Err` item or the end of the
/// stream means the watch is gone; the store does not resubscribe.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// An open prefix watch
pub struct Watcher {
    pub id: WatchId,
    pub events: WatchStream,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("id", &self.id).finish()
    }
}

/// Coordination key-value store consumed by the election core.
///
/// Every call is atomic-or-failed: implementations report failures as
/// errors (typically [`Error::CoordinationUnavailable`](crate::Error::CoordinationUnavailable))
/// and never silently skip an operation. No retry is expected at this layer.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `value` under `key`. A key already bound to a lease keeps that
    /// binding; the write does not extend the lease.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Write `value` under `key` bound to `lease`, like etcd's put with a
    /// lease attached. Fails with `LeaseNotFound` and writes nothing when
    /// the lease has expired or was revoked.
    async fn put_leased(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Every key starting with `prefix`, in key order
    async fn get_all(&self, prefix: &str) -> Result<BTreeMap<String, Bytes>>;

    /// Remove `key`; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribe to mutations of every key starting with `prefix`
    async fn watch(&self, prefix: &str) -> Result<Watcher>;

    /// Close a watch; its stream ends after any already queued events
    async fn cancel_watch(&self, watch: WatchId) -> Result<()>;

    /// Create a lease of `ttl` and bind the existing `key` to it
    async fn create_lease(&self, key: &str, ttl: Duration) -> Result<LeaseId>;

    /// Restart the lease's TTL window
    async fn renew_lease(&self, lease: LeaseId) -> Result<()>;

    /// Drop the lease now, deleting its bound keys
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_value_str() {
        let put = WatchEvent::put("taskrunner/a", Bytes::from_static(b"b"), 3);
        assert_eq!(put.kind, WatchEventKind::Put);
        assert_eq!(put.value_str(), Some("b"));

        let delete = WatchEvent::delete("taskrunner/a", 4);
        assert_eq!(delete.kind, WatchEventKind::Delete);
        assert_eq!(delete.value_str(), None);

        let binary = WatchEvent::put("taskrunner/a", Bytes::from_static(&[0xff, 0xfe]), 5);
        assert_eq!(binary.value_str(), None);
    }
}
