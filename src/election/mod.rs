//! Leader election with automatic failover
//!
//! Every node of a system keeps one leased vote record, `{system}/{hostname}`,
//! whose value is the hostname it believes leads. Nodes watch the system
//! prefix and, on every put or delete, re-count the live votes:
//! - a candidate holding ⌊N/2⌋ + 1 votes is the leader
//! - without such a candidate, a node adopts the hinted candidate (or itself)
//!   as its vote, which converges the cluster on a majority
//!
//! The leader refreshes its self-vote on a heartbeat. A crashed node stops
//! renewing its lease, the store deletes its record, and the delete event
//! triggers a new resolution among the survivors.

pub mod coordinator;
pub mod key;
pub mod notifier;
pub mod quorum;
pub mod state;

pub use coordinator::{Campaign, ClusterCoordinator};
pub use key::VoteKey;
pub use notifier::{LeadershipChange, LeadershipNotifier, SubscriptionId};
pub use quorum::{quorum, tally_votes, Tally};
pub use state::{ElectionRole, ElectionStatus};
