//! Error types for electkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the election core can surface.
///
/// The type is `Clone` so the terminal outcome of a campaign can be handed to
/// every [`Campaign`](crate::election::Campaign) handle that waits on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // === Coordination store ===
    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Watch stream failure: {0}")]
    WatchStreamFailure(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(u64),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    // === Election ===
    #[error("Invalid vote key: {0}")]
    InvalidKey(String),

    #[error("Already campaigning for system {current}, cannot campaign for {requested}")]
    AlreadyCampaigning { current: String, requested: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that end a campaign. The process is expected to stop and let
    /// its lease expire rather than recover in place.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_)
                | Error::WatchStreamFailure(_)
                | Error::LeaseNotFound(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::CoordinationUnavailable("down".into()).is_fatal());
        assert!(Error::WatchStreamFailure("reset".into()).is_fatal());
        assert!(Error::LeaseNotFound(7).is_fatal());
        assert!(!Error::InvalidConfig("bad".into()).is_fatal());
        assert!(!Error::InvalidKey("a/b".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::AlreadyCampaigning {
            current: "taskrunner".into(),
            requested: "broadcast".into(),
        };
        assert_eq!(
            err.to_string(),
            "Already campaigning for system taskrunner, cannot campaign for broadcast"
        );
        assert_eq!(Error::from("plain").to_string(), "plain");
    }
}
