//! In-process coordination store
//!
//! Linearizable by construction: every operation runs under one lock and
//! bumps a single revision counter. Lease deadlines use `tokio::time` so
//! tests can drive expiry with a paused clock.
//!
//! Expiry happens lazily at the start of every operation and, optionally,
//! from a background reaper ([`MemoryStore::spawn_reaper`]).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{CoordinationStore, LeaseId, WatchEvent, WatchId, Watcher};
use crate::common::{Error, Result};

struct Entry {
    value: Bytes,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchSubscription {
    prefix: String,
    sender: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watches: HashMap<WatchId, WatchSubscription>,
    revision: u64,
    next_lease: u64,
    next_watch: u64,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::CoordinationUnavailable(
                "memory store is marked unavailable".into(),
            ));
        }
        Ok(())
    }

    fn publish(&mut self, event: WatchEvent) {
        // Subscribers whose stream was dropped are pruned here.
        self.watches.retain(|_, watch| {
            if !event.key.starts_with(&watch.prefix) {
                return !watch.sender.is_closed();
            }
            watch.sender.send(Ok(event.clone())).is_ok()
        });
    }

    fn put(&mut self, key: &str, value: Bytes) {
        self.revision += 1;
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = value.clone(),
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        lease: None,
                    },
                );
            }
        }
        let event = WatchEvent::put(key, value, self.revision);
        self.publish(event);
    }

    /// Move `key` onto `lease`, detaching it from any previous lease
    fn bind(&mut self, key: &str, lease: LeaseId) {
        let previous = self
            .entries
            .get_mut(key)
            .and_then(|entry| entry.lease.replace(lease));
        if let Some(old) = previous.filter(|old| *old != lease) {
            if let Some(old) = self.leases.get_mut(&old) {
                old.keys.remove(key);
            }
        }
        if let Some(bound) = self.leases.get_mut(&lease) {
            bound.keys.insert(key.to_string());
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        self.revision += 1;
        let event = WatchEvent::delete(key, self.revision);
        self.publish(event);
        true
    }

    fn drop_lease(&mut self, id: LeaseId) -> Option<Lease> {
        let lease = self.leases.remove(&id)?;
        for key in &lease.keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.lease = None;
            }
            self.delete(key);
        }
        Some(lease)
    }

    fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &due {
            if let Some(lease) = self.drop_lease(*id) {
                tracing::debug!("{} expired, deleted {} key(s)", id, lease.keys.len());
            }
        }
        due.len()
    }
}

/// In-memory [`CoordinationStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".into()))
    }

    /// Lock, expire due leases, and fail if the store is marked unavailable
    fn begin(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        inner.expire_due(Instant::now());
        Ok(inner)
    }

    /// Delete keys of every lease past its deadline. Returns the number of
    /// expired leases.
    pub fn expire_leases(&self) -> Result<usize> {
        Ok(self.lock()?.expire_due(Instant::now()))
    }

    /// Periodically expire leases until the store is dropped
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.expire_leases() {
                    tracing::error!("lease reaper stopped: {}", e);
                    break;
                }
            }
        })
    }

    /// Simulate losing (or regaining) the connection to the store. While
    /// unavailable every call fails with `CoordinationUnavailable`.
    pub fn set_available(&self, available: bool) -> Result<()> {
        self.lock()?.unavailable = !available;
        Ok(())
    }

    /// Terminate every open watch with `WatchStreamFailure(reason)`
    pub fn fail_watches(&self, reason: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let watches = std::mem::take(&mut inner.watches);
        for watch in watches.values() {
            let _ = watch
                .sender
                .send(Err(Error::WatchStreamFailure(reason.to_string())));
        }
        Ok(watches.len())
    }

    /// Current store revision
    pub fn revision(&self) -> Result<u64> {
        Ok(self.lock()?.revision)
    }

    /// Number of open watches
    pub fn watch_count(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        inner.watches.retain(|_, watch| !watch.sender.is_closed());
        Ok(inner.watches.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.begin()?.put(key, value);
        Ok(())
    }

    async fn put_leased(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<()> {
        let mut inner = self.begin()?;
        if !inner.leases.contains_key(&lease) {
            return Err(Error::LeaseNotFound(lease.0));
        }
        inner.put(key, value);
        inner.bind(key, lease);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.begin()?.entries.get(key).map(|e| e.value.clone()))
    }

    async fn get_all(&self, prefix: &str) -> Result<BTreeMap<String, Bytes>> {
        let inner = self.begin()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.begin()?.delete(key);
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<Watcher> {
        let mut inner = self.begin()?;
        inner.next_watch += 1;
        let id = WatchId(inner.next_watch);
        let (sender, receiver) = mpsc::unbounded_channel();
        inner.watches.insert(
            id,
            WatchSubscription {
                prefix: prefix.to_string(),
                sender,
            },
        );
        Ok(Watcher {
            id,
            events: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn cancel_watch(&self, watch: WatchId) -> Result<()> {
        self.begin()?.watches.remove(&watch);
        Ok(())
    }

    async fn create_lease(&self, key: &str, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.begin()?;
        if !inner.entries.contains_key(key) {
            return Err(Error::KeyNotFound(key.to_string()));
        }

        inner.next_lease += 1;
        let id = LeaseId(inner.next_lease);

        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        // Rebinding moves the key off its previous lease.
        inner.bind(key, id);
        Ok(id)
    }

    async fn renew_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.begin()?;
        let lease = inner
            .leases
            .get_mut(&lease)
            .ok_or(Error::LeaseNotFound(lease.0))?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.begin()?
            .drop_lease(lease)
            .map(|_| ())
            .ok_or(Error::LeaseNotFound(lease.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WatchEventKind;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("taskrunner/a", b("a")).await.unwrap();
        assert_eq!(store.get("taskrunner/a").await.unwrap(), Some(b("a")));

        store.delete("taskrunner/a").await.unwrap();
        assert_eq!(store.get("taskrunner/a").await.unwrap(), None);

        // Deleting a missing key is fine
        store.delete("taskrunner/a").await.unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_get_all_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.put("task/x", b("x")).await.unwrap();
        store.put("taskrunner/a", b("a")).await.unwrap();
        store.put("taskrunner/b", b("a")).await.unwrap();
        store.put("zzz/c", b("c")).await.unwrap();

        let all = store.get_all("taskrunner/").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("taskrunner/a"));
        assert!(all.contains_key("taskrunner/b"));
    }

    #[tokio::test]
    async fn test_watch_receives_prefix_events_in_order() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("taskrunner/").await.unwrap();

        store.put("taskrunner/a", b("a")).await.unwrap();
        store.put("other/a", b("a")).await.unwrap();
        store.put("taskrunner/a", b("b")).await.unwrap();
        store.delete("taskrunner/a").await.unwrap();

        let first = watcher.events.next().await.unwrap().unwrap();
        assert_eq!(first.kind, WatchEventKind::Put);
        assert_eq!(first.value_str(), Some("a"));

        let second = watcher.events.next().await.unwrap().unwrap();
        assert_eq!(second.value_str(), Some("b"));
        assert!(second.revision > first.revision);

        let third = watcher.events.next().await.unwrap().unwrap();
        assert_eq!(third.kind, WatchEventKind::Delete);
        assert_eq!(third.key, "taskrunner/a");
    }

    #[tokio::test]
    async fn test_cancel_watch_ends_stream() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("taskrunner/").await.unwrap();
        store.cancel_watch(watcher.id).await.unwrap();
        store.put("taskrunner/a", b("a")).await.unwrap();
        assert!(watcher.events.next().await.is_none());
        assert_eq!(store.watch_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fail_watches_is_terminal() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("taskrunner/").await.unwrap();
        assert_eq!(store.fail_watches("connection reset").unwrap(), 1);

        let item = watcher.events.next().await.unwrap();
        assert_eq!(
            item,
            Err(Error::WatchStreamFailure("connection reset".into()))
        );
        assert!(watcher.events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_create_lease_requires_key() {
        let store = MemoryStore::new();
        let err = store
            .create_lease("taskrunner/a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::KeyNotFound("taskrunner/a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_key() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("taskrunner/").await.unwrap();
        store.put("taskrunner/a", b("a")).await.unwrap();
        store
            .create_lease("taskrunner/a", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("taskrunner/a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.expire_leases().unwrap(), 1);
        assert!(store.get("taskrunner/a").await.unwrap().is_none());

        let put = watcher.events.next().await.unwrap().unwrap();
        assert_eq!(put.kind, WatchEventKind::Put);
        let delete = watcher.events.next().await.unwrap().unwrap();
        assert_eq!(delete.kind, WatchEventKind::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_does_not_extend_lease_but_renew_does() {
        let store = MemoryStore::new();
        store.put("taskrunner/a", b("a")).await.unwrap();
        let lease = store
            .create_lease("taskrunner/a", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        store.put("taskrunner/a", b("b")).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("taskrunner/a").await.unwrap().is_none());

        store.put("taskrunner/b", b("b")).await.unwrap();
        let lease_b = store
            .create_lease("taskrunner/b", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        store.renew_lease(lease_b).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("taskrunner/b").await.unwrap(), Some(b("b")));

        assert_eq!(
            store.renew_lease(lease).await,
            Err(Error::LeaseNotFound(lease.0))
        );
    }

    #[tokio::test]
    async fn test_put_leased_requires_live_lease() {
        let store = MemoryStore::new();
        store.put("taskrunner/a", b("a")).await.unwrap();
        let lease = store
            .create_lease("taskrunner/a", Duration::from_secs(60))
            .await
            .unwrap();

        store
            .put_leased("taskrunner/a", b("b"), lease)
            .await
            .unwrap();
        assert_eq!(store.get("taskrunner/a").await.unwrap(), Some(b("b")));

        store.revoke_lease(lease).await.unwrap();
        assert!(store.is_empty().unwrap());
        let revision = store.revision().unwrap();

        assert_eq!(
            store.put_leased("taskrunner/a", b("a"), lease).await,
            Err(Error::LeaseNotFound(lease.0))
        );
        assert!(store.is_empty().unwrap());
        assert_eq!(store.revision().unwrap(), revision);
    }

    #[tokio::test]
    async fn test_put_leased_binds_new_key() {
        let store = MemoryStore::new();
        store.put("taskrunner/a", b("a")).await.unwrap();
        let lease = store
            .create_lease("taskrunner/a", Duration::from_secs(60))
            .await
            .unwrap();

        store
            .put_leased("taskrunner/b", b("a"), lease)
            .await
            .unwrap();
        store.revoke_lease(lease).await.unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_revoke_lease_deletes_key() {
        let store = MemoryStore::new();
        store.put("taskrunner/a", b("a")).await.unwrap();
        let lease = store
            .create_lease("taskrunner/a", Duration::from_secs(60))
            .await
            .unwrap();

        store.revoke_lease(lease).await.unwrap();
        assert!(store.get("taskrunner/a").await.unwrap().is_none());
        assert!(store.revoke_lease(lease).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_without_traffic() {
        let store = Arc::new(MemoryStore::new());
        store.put("taskrunner/a", b("a")).await.unwrap();
        store
            .create_lease("taskrunner/a", Duration::from_secs(2))
            .await
            .unwrap();
        let reaper = store.spawn_reaper(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.len().unwrap(), 0);
        reaper.abort();
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false).unwrap();
        assert!(matches!(
            store.put("taskrunner/a", b("a")).await,
            Err(Error::CoordinationUnavailable(_))
        ));
        assert!(matches!(
            store.get_all("taskrunner/").await,
            Err(Error::CoordinationUnavailable(_))
        ));
        assert!(store.watch("taskrunner/").await.is_err());

        store.set_available(true).unwrap();
        assert!(store.put("taskrunner/a", b("a")).await.is_ok());
    }
}
