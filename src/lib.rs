//! # electkv
//!
//! Leader election with automatic failover for replicated services, built on
//! a generic coordination key-value store (etcd-style):
//! - One leased vote record per live node, deleted when the node stops renewing
//! - Watch-driven quorum tally to pick a single leader per system
//! - Heartbeat that keeps the leader's mandate alive
//! - Leadership change notifications for the work that only the leader runs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Coordination store                │
//! │  taskrunner/node-a = node-b   (lease 1)      │
//! │  taskrunner/node-b = node-b   (lease 2)      │
//! │  taskrunner/node-c = node-b   (lease 3)      │
//! └───────┬───────────────┬──────────────┬───────┘
//!         │ watch/put     │              │
//! ┌───────▼──────┐ ┌──────▼───────┐ ┌────▼─────────┐
//! │ node-a       │ │ node-b       │ │ node-c       │
//! │ follower     │ │ LEADER       │ │ follower     │
//! │              │ │ + heartbeat  │ │              │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use electkv::{ClusterCoordinator, ElectionConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> electkv::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let coordinator = ClusterCoordinator::new(store, "node-a", ElectionConfig::default());
//!
//! coordinator.on_leadership_change(|change| {
//!     if change.is_self {
//!         // start the scheduler
//!     }
//! });
//!
//! let campaign = coordinator.campaign("taskrunner").await?;
//! campaign.join().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Simulate a cluster
//! ```bash
//! electkv simulate --nodes 3 --kill-leader-after 5s --run-for 20s
//! ```

pub mod common;
pub mod election;
pub mod store;

// Re-export commonly used types
pub use common::{Config, ElectionConfig, Error, Result};
pub use election::{
    Campaign, ClusterCoordinator, ElectionRole, ElectionStatus, LeadershipChange,
    LeadershipNotifier, VoteKey,
};
pub use store::{CoordinationStore, MemoryStore, WatchEvent, WatchEventKind};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
