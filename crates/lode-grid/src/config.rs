//! Member configuration.
//!
//! Every field has a default, so an empty file (or none at all) is a valid
//! configuration. The binary layers CLI and environment overrides on top
//! of whatever `from_file` returns.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lode_cluster::{ConsistencyMode, MembershipConfig, QuorumPolicy, ReadPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub node: NodeConfig,
    pub membership: MembershipSection,
    pub replication: ReplicationConfig,
    pub router: RouterConfig,
    pub rebalance: RebalanceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address other members reach this one on.
    pub bind: SocketAddr,
    /// Members contacted when joining. Empty founds a new cluster.
    pub seeds: Vec<SocketAddr>,
    /// Redundancy zone; copies of a bucket are spread across zones.
    pub zone: Option<String>,
    /// Request queue depth of each bucket actor.
    pub bucket_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7400)),
            seeds: Vec::new(),
            zone: None,
            bucket_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    pub heartbeat_interval_ms: u64,
    pub suspect_after_missed: u32,
    pub depart_after_missed: u32,
    pub coordinator_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub consistency: ConsistencyMode,
}

impl Default for MembershipSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            suspect_after_missed: 3,
            depart_after_missed: 6,
            coordinator_timeout_ms: 5000,
            election_timeout_ms: 5000,
            consistency: ConsistencyMode::Strict,
        }
    }
}

impl MembershipSection {
    pub fn to_membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            suspect_after_missed: self.suspect_after_missed,
            depart_after_missed: self.depart_after_missed,
            coordinator_timeout: Duration::from_millis(self.coordinator_timeout_ms),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            consistency: self.consistency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// How long a primary waits for its write quorum.
    pub quorum_timeout_ms: u64,
    /// Applied to regions created without an explicit policy.
    pub default_quorum: QuorumPolicy,
    pub default_read_policy: ReadPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            quorum_timeout_ms: 2000,
            default_quorum: QuorumPolicy::All,
            default_read_policy: ReadPolicy::Primary,
        }
    }
}

impl ReplicationConfig {
    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Retries after the first attempt on a routing error.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for one remote call.
    pub request_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 20,
            backoff_max_ms: 1000,
            request_timeout_ms: 3000,
        }
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    pub enabled: bool,
    /// Pause between rebalance moves.
    pub move_interval_ms: u64,
    pub max_moves_per_pass: usize,
    pub handoff_chunk_entries: usize,
    pub chunk_timeout_ms: u64,
    pub max_chunk_retries: u32,
    /// How long a move waits for its new copy to be seeded.
    pub handoff_timeout_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            move_interval_ms: 200,
            max_moves_per_pass: 16,
            handoff_chunk_entries: 256,
            chunk_timeout_ms: 2000,
            max_chunk_retries: 5,
            handoff_timeout_ms: 60_000,
        }
    }
}

impl RebalanceConfig {
    pub fn move_interval(&self) -> Duration {
        Duration::from_millis(self.move_interval_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }
}

impl GridConfig {
    /// Loads a config file. Missing sections and fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the config as TOML, e.g. for `--config-template`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.membership;
        if m.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "membership.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if m.suspect_after_missed == 0 || m.depart_after_missed <= m.suspect_after_missed {
            return Err(ConfigError::Invalid(format!(
                "membership.depart_after_missed ({}) must exceed suspect_after_missed ({}) and both be positive",
                m.depart_after_missed, m.suspect_after_missed
            )));
        }
        if self.node.bucket_queue == 0 {
            return Err(ConfigError::Invalid("node.bucket_queue must be positive".into()));
        }
        if self.rebalance.handoff_chunk_entries == 0 {
            return Err(ConfigError::Invalid(
                "rebalance.handoff_chunk_entries must be positive".into(),
            ));
        }
        if self.router.backoff_max_ms < self.router.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "router.backoff_max_ms must be at least backoff_base_ms".into(),
            ));
        }
        Ok(())
    }
}
