//! Vote record keys
//!
//! Each live node owns exactly one key, `{system}/{hostname}`. Neither
//! segment may contain the separator, which keeps `encode` injective and
//! `decode` its exact inverse.

use serde::{Deserialize, Serialize};

use crate::common::{validate_segment, Error, Result};

/// Separator between the system and hostname segments
pub const SEPARATOR: char = '/';

/// Typed composite key of a vote record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoteKey {
    system: String,
    hostname: String,
}

impl VoteKey {
    pub fn new(system: impl Into<String>, hostname: impl Into<String>) -> Result<Self> {
        let system = system.into();
        let hostname = hostname.into();
        validate_segment(&system, SEPARATOR)?;
        validate_segment(&hostname, SEPARATOR)?;
        Ok(Self { system, hostname })
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Store key for this record
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.system, SEPARATOR, self.hostname)
    }

    /// Parse a store key back into its segments
    pub fn decode(key: &str) -> Result<Self> {
        let (system, hostname) = key
            .split_once(SEPARATOR)
            .ok_or_else(|| Error::InvalidKey(format!("{:?} has no separator", key)))?;
        Self::new(system, hostname)
            .map_err(|e| Error::InvalidKey(format!("{:?}: {}", key, e)))
    }

    /// Watch/range prefix covering every vote record of `system`.
    ///
    /// The trailing separator keeps `task` from matching `taskrunner`.
    pub fn prefix(system: &str) -> Result<String> {
        validate_segment(system, SEPARATOR)?;
        Ok(format!("{}{}", system, SEPARATOR))
    }
}

impl std::fmt::Display for VoteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.system, SEPARATOR, self.hostname)
    }
}
