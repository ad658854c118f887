//! Cluster coordinator
//!
//! A campaign runs in one driver task per node. That task owns the local
//! leadership state and is the only place it changes: watch events, the
//! leader heartbeat and lease keepalive are multiplexed with `select!`, so a
//! heartbeat's "am I still leader" check can never interleave with a
//! leadership change.
//!
//! ```text
//! campaign(system)
//!   ├─ put {system}/{host} = host        (self-vote)
//!   ├─ create lease (TTL = election timeout)
//!   ├─ watch {system}/
//!   └─ driver task
//!        ├─ initial resolution
//!        ├─ put/delete event ─▶ resolve(hint) ─▶ leader changed? notify
//!        ├─ heartbeat (leader only): put self-vote, renew lease
//!        └─ keepalive: renew lease
//! ```

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::common::{ElectionConfig, Error, Result};
use crate::election::key::VoteKey;
use crate::election::notifier::{LeadershipChange, LeadershipNotifier, SubscriptionId};
use crate::election::quorum::tally_votes;
use crate::election::state::{ElectionRole, ElectionStatus};
use crate::store::{CoordinationStore, LeaseId, WatchEvent, WatchEventKind, Watcher};

/// Leader election for one node
pub struct ClusterCoordinator {
    store: Arc<dyn CoordinationStore>,
    hostname: String,
    config: ElectionConfig,
    notifier: LeadershipNotifier,
    status: Arc<watch::Sender<ElectionStatus>>,
    campaign: Mutex<Option<Campaign>>,
}

impl ClusterCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        hostname: impl Into<String>,
        config: ElectionConfig,
    ) -> Self {
        let (status, _) = watch::channel(ElectionStatus::default());
        Self {
            store,
            hostname: hostname.into(),
            config,
            notifier: LeadershipNotifier::new(),
            status: Arc::new(status),
            campaign: Mutex::new(None),
        }
    }

    /// Coordinator identified by the configured hostname, or the OS
    /// hostname when none is set. The configuration is validated first.
    pub fn from_config(
        store: Arc<dyn CoordinationStore>,
        config: &ElectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(store, config.resolve_hostname(), config.clone()))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn notifier(&self) -> &LeadershipNotifier {
        &self.notifier
    }

    /// Call `listener` with every change of resolved leader
    pub fn on_leadership_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&LeadershipChange) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    /// Last resolved leader, `None` while undetermined
    pub fn current_leader(&self) -> Option<String> {
        self.status.borrow().leader.clone()
    }

    pub fn status(&self) -> ElectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ElectionStatus> {
        self.status.subscribe()
    }

    /// Register this node in `system` and start following its election.
    ///
    /// Calling again for the same system while the campaign runs returns a
    /// handle to the running campaign. Registration failures are returned
    /// as is (typically `CoordinationUnavailable`); nothing is retried.
    pub async fn campaign(&self, system: &str) -> Result<Campaign> {
        let mut slot = self.campaign.lock().await;
        if let Some(running) = slot.as_ref().filter(|c| !c.is_finished()) {
            if running.system() == system {
                return Ok(running.clone());
            }
            return Err(Error::AlreadyCampaigning {
                current: running.system().to_string(),
                requested: system.to_string(),
            });
        }

        let key = VoteKey::new(system, self.hostname.as_str())?;
        self.config.validate()?;
        set_status(&self.status, ElectionRole::Registering, None);

        let (lease, watcher) = match self.register(&key).await {
            Ok(registered) => registered,
            Err(e) => {
                tracing::error!("Campaign registration for {} failed: {}", key, e);
                set_status(&self.status, ElectionRole::Failed, None);
                return Err(e);
            }
        };
        set_status(&self.status, ElectionRole::Undetermined, None);

        let driver = Driver {
            store: self.store.clone(),
            own_key: key.encode(),
            key,
            lease,
            config: self.config.clone(),
            notifier: self.notifier.clone(),
            status: self.status.clone(),
            leader: None,
            heartbeat_at: None,
            finished: false,
        };

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(driver.run(watcher, shutdown.clone(), outcome_tx));

        let campaign = Campaign {
            system: system.to_string(),
            lease,
            outcome: outcome_rx,
            shutdown,
            task: task.abort_handle(),
        };
        *slot = Some(campaign.clone());
        Ok(campaign)
    }

    /// One resolution pass for `system`: the quorum winner if there is one,
    /// otherwise `hint` (or this node), which is also written as our vote.
    /// While campaigning in `system` the write is bound to the campaign's lease.
    pub async fn determine_current_leader(
        &self,
        system: &str,
        hint: Option<&str>,
    ) -> Result<String> {
        let key = VoteKey::new(system, self.hostname.as_str())?;
        let lease = self
            .campaign
            .lock()
            .await
            .as_ref()
            .filter(|c| c.system() == system && !c.is_finished())
            .map(|c| c.lease);
        Ok(resolve(self.store.as_ref(), &key, hint, lease).await?.leader)
    }

    async fn register(&self, key: &VoteKey) -> Result<(LeaseId, Watcher)> {
        let own_key = key.encode();
        self.store
            .put(&own_key, Bytes::from(self.hostname.clone()))
            .await?;

        tracing::info!(
            "Registered {}, creating lease with TTL {:?}",
            own_key,
            self.config.election_timeout()
        );
        let lease = match self
            .store
            .create_lease(&own_key, self.config.election_timeout())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&own_key).await {
                    tracing::warn!("Could not remove unleased vote {}: {}", own_key, cleanup);
                }
                return Err(e);
            }
        };

        let prefix = VoteKey::prefix(key.system())?;
        match self.store.watch(&prefix).await {
            Ok(watcher) => Ok((lease, watcher)),
            Err(e) => {
                if let Err(cleanup) = self.store.revoke_lease(lease).await {
                    tracing::warn!("Could not revoke {}: {}", lease, cleanup);
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("hostname", &self.hostname)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Handle on a running campaign
#[derive(Clone)]
pub struct Campaign {
    system: String,
    lease: LeaseId,
    outcome: watch::Receiver<Option<Result<()>>>,
    shutdown: Arc<Notify>,
    task: AbortHandle,
}

impl Campaign {
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Lease every vote record of this campaign is bound to
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some() || self.task.is_finished()
    }

    /// Wait for the campaign to end. Fatal errors (`WatchStreamFailure`,
    /// `CoordinationUnavailable`, ...) surface here; `Ok` means it resigned.
    pub async fn join(&self) -> Result<()> {
        let mut outcome = self.outcome.clone();
        loop {
            let current = outcome.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if outcome.changed().await.is_err() {
                let last = outcome.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(Error::Internal(
                        "campaign task stopped before reporting an outcome".into(),
                    ))
                });
            }
        }
    }

    /// Leave the election: stop the driver and revoke the lease so the vote
    /// record disappears immediately.
    pub async fn resign(&self) -> Result<()> {
        self.shutdown.notify_one();
        self.join().await
    }

    /// Stop the driver without touching the store, as a crash would. The
    /// vote record stays until its lease expires.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Campaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Campaign")
            .field("system", &self.system)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn set_status(status: &watch::Sender<ElectionStatus>, role: ElectionRole, leader: Option<String>) {
    status.send_modify(|current| {
        debug_assert!(
            current.role.can_transition_to(role),
            "illegal election transition {} -> {}",
            current.role,
            role
        );
        current.role = role;
        current.leader = leader;
    });
}

/// Outcome of one resolution pass
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resolution {
    leader: String,
    /// Whether `leader` holds a quorum, as opposed to a fallback vote
    quorum: bool,
    /// This node's vote value after the pass
    own_vote: Option<String>,
}

/// Live votes of `system` as voter hostname → voted-for hostname
async fn read_votes(
    store: &dyn CoordinationStore,
    system: &str,
) -> Result<BTreeMap<String, String>> {
    let prefix = VoteKey::prefix(system)?;
    let mut votes = BTreeMap::new();
    for (raw_key, value) in store.get_all(&prefix).await? {
        match VoteKey::decode(&raw_key) {
            Ok(key) if key.system() == system => {
                votes.insert(
                    key.hostname().to_string(),
                    String::from_utf8_lossy(&value).into_owned(),
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring record under {}: {}", prefix, e),
        }
    }
    Ok(votes)
}

/// Write this node's vote, bound to `lease` when campaigning so the record
/// can never outlive the lease.
async fn write_vote(
    store: &dyn CoordinationStore,
    key: &str,
    vote: &str,
    lease: Option<LeaseId>,
) -> Result<()> {
    let value = Bytes::from(vote.to_string());
    match lease {
        Some(lease) => store.put_leased(key, value, lease).await,
        None => store.put(key, value).await,
    }
}

/// Tally the live votes; without a quorum winner, vote for `hint` (or
/// ourselves) and report that as the provisional leader.
async fn resolve(
    store: &dyn CoordinationStore,
    key: &VoteKey,
    hint: Option<&str>,
    lease: Option<LeaseId>,
) -> Result<Resolution> {
    let votes = read_votes(store, key.system()).await?;
    let tally = tally_votes(&votes);
    let own_vote = votes.get(key.hostname()).cloned();

    if let Some(winner) = tally.winner {
        tracing::debug!(
            "{}: {} holds {}/{} votes (quorum {})",
            key.system(),
            winner,
            tally.counts.get(&winner).copied().unwrap_or(0),
            tally.members,
            tally.quorum
        );
        return Ok(Resolution {
            leader: winner,
            quorum: true,
            own_vote,
        });
    }

    let fallback = hint.unwrap_or(key.hostname()).to_string();
    tracing::debug!(
        "{}: no quorum among {} vote(s), voting for {}",
        key.system(),
        tally.members,
        fallback
    );
    // Unlike an unconditional set, an aligned vote is left alone: rewriting
    // it would emit a put event that every node answers with another pass.
    if own_vote.as_deref() != Some(fallback.as_str()) {
        write_vote(store, &key.encode(), &fallback, lease).await?;
    }

    Ok(Resolution {
        leader: fallback.clone(),
        quorum: false,
        own_vote: Some(fallback),
    })
}

/// State owned by the campaign task
struct Driver {
    store: Arc<dyn CoordinationStore>,
    key: VoteKey,
    own_key: String,
    lease: LeaseId,
    config: ElectionConfig,
    notifier: LeadershipNotifier,
    status: Arc<watch::Sender<ElectionStatus>>,
    leader: Option<String>,
    /// Next heartbeat; `None` when the heartbeat loop is not running
    heartbeat_at: Option<Instant>,
    /// Set once the outcome has been published
    finished: bool,
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Aborted mid-campaign: nothing else will update the status.
        if !self.finished {
            set_status(&self.status, ElectionRole::Failed, self.leader.clone());
        }
    }
}

impl Driver {
    async fn run(
        mut self,
        mut watcher: Watcher,
        shutdown: Arc<Notify>,
        outcome: watch::Sender<Option<Result<()>>>,
    ) {
        let result = self.drive(&mut watcher, &shutdown).await;

        if let Err(e) = self.store.cancel_watch(watcher.id).await {
            tracing::debug!("Cancelling watch on {} failed: {}", self.key.system(), e);
        }

        match &result {
            Ok(()) => {
                tracing::info!("{} resigned from {}", self.key.hostname(), self.key.system());
                set_status(&self.status, ElectionRole::Unregistered, None);
            }
            Err(e) => {
                tracing::error!("Campaign for {} failed: {}", self.key, e);
                set_status(&self.status, ElectionRole::Failed, self.leader.clone());
            }
        }
        self.finished = true;
        outcome.send_replace(Some(result));
    }

    async fn drive(&mut self, watcher: &mut Watcher, shutdown: &Notify) -> Result<()> {
        // Our own registration happened before the watch existed.
        self.apply(None).await?;

        let keepalive_every = self.config.keepalive_interval();
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let heartbeat_at = self.heartbeat_at;
            tokio::select! {
                biased;

                _ = shutdown.notified() => return self.resign().await,

                event = watcher.events.next() => match event {
                    Some(Ok(event)) => self.on_event(event).await?,
                    Some(Err(Error::WatchStreamFailure(reason))) => {
                        return Err(Error::WatchStreamFailure(reason))
                    }
                    Some(Err(e)) => return Err(Error::WatchStreamFailure(e.to_string())),
                    None => return Err(Error::WatchStreamFailure("watch stream closed".into())),
                },

                _ = tokio::time::sleep_until(heartbeat_at.unwrap_or_else(Instant::now)),
                    if heartbeat_at.is_some() => self.heartbeat().await?,

                _ = keepalive.tick() => self.store.renew_lease(self.lease).await?,
            }
        }
    }

    async fn on_event(&mut self, event: WatchEvent) -> Result<()> {
        tracing::debug!(
            "Watch {} {} (revision {})",
            event.kind,
            event.key,
            event.revision
        );
        let hint = match event.kind {
            WatchEventKind::Put => event
                .value
                .as_deref()
                .map(|v| String::from_utf8_lossy(v).into_owned()),
            WatchEventKind::Delete => None,
        };
        self.apply(hint.as_deref()).await
    }

    async fn apply(&mut self, hint: Option<&str>) -> Result<()> {
        let resolution = resolve(self.store.as_ref(), &self.key, hint, Some(self.lease)).await?;

        if self.leader.as_deref() != Some(resolution.leader.as_str()) {
            self.change_leader(resolution.leader, resolution.quorum);
            return Ok(());
        }

        // Same leader: re-affirm our vote. The refresh is skipped when the
        // stored vote already matches, otherwise re-affirmations would echo
        // through everyone's watch.
        if resolution.own_vote.as_deref() != Some(resolution.leader.as_str()) {
            write_vote(
                self.store.as_ref(),
                &self.own_key,
                &resolution.leader,
                Some(self.lease),
            )
            .await?;
        }
        Ok(())
    }

    fn change_leader(&mut self, leader: String, quorum: bool) {
        let is_self = leader == self.key.hostname();
        tracing::info!(
            "New leader for {}: {}{}",
            self.key.system(),
            leader,
            if quorum { "" } else { " (no quorum yet)" }
        );

        self.leader = Some(leader.clone());
        set_status(
            &self.status,
            ElectionRole::for_leader(&leader, self.key.hostname()),
            Some(leader.clone()),
        );
        self.notifier.notify(&LeadershipChange {
            system: self.key.system().to_string(),
            leader,
            is_self,
            at: Utc::now(),
        });

        if is_self {
            self.heartbeat_at = Some(Instant::now());
        }
    }

    /// One heartbeat iteration. The guard re-checks leadership, so a node
    /// that lost the mandate simply stops beating.
    async fn heartbeat(&mut self) -> Result<()> {
        if self.leader.as_deref() != Some(self.key.hostname()) {
            tracing::debug!("{} is no longer leader, heartbeat stopped", self.key.hostname());
            self.heartbeat_at = None;
            return Ok(());
        }

        write_vote(
            self.store.as_ref(),
            &self.own_key,
            self.key.hostname(),
            Some(self.lease),
        )
        .await?;
        self.store.renew_lease(self.lease).await?;
        self.heartbeat_at = Some(Instant::now() + self.config.heartbeat_interval());
        Ok(())
    }

    async fn resign(&mut self) -> Result<()> {
        self.heartbeat_at = None;
        match self.store.revoke_lease(self.lease).await {
            Ok(()) => Ok(()),
            // Lease already gone; make sure the record is too.
            Err(Error::LeaseNotFound(_)) => self.store.delete(&self.own_key).await,
            Err(e) => Err(e),
        }
    }
}
