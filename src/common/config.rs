//! Configuration for electkv
//!
//! Values are layered: built-in defaults, then an optional `electkv.toml`,
//! then `ELECTKV_*` environment variables (`__` separates nesting, e.g.
//! `ELECTKV_ELECTION__HEARTBEAT_INTERVAL_MS=500`).

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::common::utils::{local_hostname, validate_segment};
use crate::election::key::SEPARATOR;

const ENV_PREFIX: &str = "ELECTKV";
const DEFAULT_CONFIG_FILE: &str = "electkv";

/// Global configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Election settings
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election: ElectionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `electkv.toml` (if present) and the environment.
    pub fn load() -> crate::Result<Self> {
        Self::build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load from an explicit TOML file, still honouring the environment.
    pub fn load_from(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::build(File::from(path.as_ref()).format(FileFormat::Toml))
    }

    fn build<S>(file: S) -> crate::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.election.validate()?;
        Ok(config)
    }
}

/// Election configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Cluster name the node campaigns in
    #[serde(default = "default_system")]
    pub system: String,

    /// Node identity; the OS hostname when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Lease TTL for the node's own vote record
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Cadence of the leader's self-vote refresh
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Cadence of lease renewal for every member; the heartbeat interval when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u64>,
}

fn default_system() -> String {
    "taskrunner".to_string()
}
fn default_election_timeout() -> u64 {
    5_000
}
fn default_heartbeat_interval() -> u64 {
    1_000
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            system: default_system(),
            hostname: None,
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            keepalive_interval_ms: None,
        }
    }
}

impl ElectionConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(
            self.keepalive_interval_ms
                .unwrap_or(self.heartbeat_interval_ms),
        )
    }

    /// Configured hostname, or the one reported by the OS.
    pub fn resolve_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(local_hostname)
    }

    /// Refresh cadences must stay well inside the lease TTL, otherwise a
    /// healthy node would evict itself between two renewals.
    pub fn validate(&self) -> crate::Result<()> {
        validate_segment(&self.system, SEPARATOR)
            .map_err(|e| crate::Error::InvalidConfig(format!("system: {}", e)))?;

        if let Some(hostname) = &self.hostname {
            validate_segment(hostname, SEPARATOR)
                .map_err(|e| crate::Error::InvalidConfig(format!("hostname: {}", e)))?;
        }

        if self.election_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "election timeout and heartbeat interval must be positive".into(),
            ));
        }

        if self.heartbeat_interval_ms.saturating_mul(2) > self.election_timeout_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be at most half the election timeout ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }

        if let Some(keepalive) = self.keepalive_interval_ms {
            if keepalive == 0 || keepalive.saturating_mul(2) > self.election_timeout_ms {
                return Err(crate::Error::InvalidConfig(format!(
                    "keepalive interval ({}ms) must be positive and at most half the election timeout ({}ms)",
                    keepalive, self.election_timeout_ms
                )));
            }
        }

        Ok(())
    }
}
