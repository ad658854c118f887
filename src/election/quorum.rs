//! Quorum tally over a snapshot of vote records

use std::collections::BTreeMap;

/// Minimum agreeing votes among `members` live records: ⌊N/2⌋ + 1.
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Result of counting one snapshot of votes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    /// Live vote records in the snapshot (N)
    pub members: usize,
    pub quorum: usize,
    /// Votes per eligible candidate
    pub counts: BTreeMap<String, usize>,
    /// Candidate holding at least `quorum` votes, if any
    pub winner: Option<String>,
}

impl Tally {
    pub fn votes_for(&self, candidate: &str) -> usize {
        self.counts.get(candidate).copied().unwrap_or(0)
    }
}

/// Count `votes` (voter hostname → voted-for hostname).
///
/// A vote only counts when the candidate has a live record of its own;
/// votes for hosts that are gone are ignored. Voters are visited in key
/// order, and a candidate reaching quorum replaces the current winner only
/// with a strictly higher count.
pub fn tally_votes(votes: &BTreeMap<String, String>) -> Tally {
    let members = votes.len();
    let required = quorum(members);
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut winner: Option<String> = None;

    for voted_for in votes.values() {
        if !votes.contains_key(voted_for) {
            continue;
        }

        let count = counts.entry(voted_for.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        let unseats = match &winner {
            None => true,
            Some(current) => count > counts.get(current).copied().unwrap_or(0),
        };
        if count >= required && unseats {
            winner = Some(voted_for.clone());
        }
    }

    Tally {
        members,
        quorum: required,
        counts,
        winner,
    }
}
