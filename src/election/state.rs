//! Per-node election state machine

use serde::{Deserialize, Serialize};

/// Where a node stands in its campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionRole {
    Unregistered,
    Registering,
    /// Registered and watching, no leader resolved yet
    Undetermined,
    Leader,
    Follower,
    /// Terminal: the campaign ended on a fatal error
    Failed,
}

impl ElectionRole {
    /// Role implied by a resolved leader
    pub fn for_leader(leader: &str, hostname: &str) -> Self {
        if leader == hostname {
            ElectionRole::Leader
        } else {
            ElectionRole::Follower
        }
    }

    /// Legal transitions of the campaign lifecycle. Any state may fail, and
    /// any state may return to `Unregistered` on resignation.
    pub fn can_transition_to(self, next: ElectionRole) -> bool {
        use ElectionRole::*;
        match (self, next) {
            (_, Failed) | (_, Unregistered) => true,
            (Unregistered, Registering) | (Failed, Registering) => true,
            (Registering, Undetermined) => true,
            (Undetermined | Leader | Follower, Leader | Follower) => true,
            _ => false,
        }
    }

    pub fn is_campaigning(self) -> bool {
        matches!(
            self,
            ElectionRole::Undetermined | ElectionRole::Leader | ElectionRole::Follower
        )
    }
}

impl std::fmt::Display for ElectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionRole::Unregistered => write!(f, "unregistered"),
            ElectionRole::Registering => write!(f, "registering"),
            ElectionRole::Undetermined => write!(f, "undetermined"),
            ElectionRole::Leader => write!(f, "leader"),
            ElectionRole::Follower => write!(f, "follower"),
            ElectionRole::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a node's leadership state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStatus {
    pub role: ElectionRole,
    /// Last resolved leader, `None` while undetermined
    pub leader: Option<String>,
}

impl Default for ElectionStatus {
    fn default() -> Self {
        Self {
            role: ElectionRole::Unregistered,
            leader: None,
        }
    }
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        self.role == ElectionRole::Leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ElectionRole::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(Unregistered.can_transition_to(Registering));
        assert!(Registering.can_transition_to(Undetermined));
        assert!(Undetermined.can_transition_to(Leader));
        assert!(Undetermined.can_transition_to(Follower));
        assert!(Leader.can_transition_to(Follower));
        assert!(Follower.can_transition_to(Leader));
        assert!(Leader.can_transition_to(Leader));
        assert!(Follower.can_transition_to(Failed));
        assert!(Leader.can_transition_to(Unregistered));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Unregistered.can_transition_to(Leader));
        assert!(!Registering.can_transition_to(Follower));
        assert!(!Leader.can_transition_to(Undetermined));
        assert!(!Failed.can_transition_to(Leader));
    }

    #[test]
    fn test_for_leader() {
        assert_eq!(ElectionRole::for_leader("a", "a"), Leader);
        assert_eq!(ElectionRole::for_leader("b", "a"), Follower);
    }

    #[test]
    fn test_status_default() {
        let status = ElectionStatus::default();
        assert_eq!(status.role, Unregistered);
        assert!(status.leader.is_none());
        assert!(!status.is_leader());
        assert!(!status.role.is_campaigning());
        assert_eq!(Follower.to_string(), "follower");
    }
}
