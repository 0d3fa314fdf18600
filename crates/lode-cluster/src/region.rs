//! Region metadata: identity, settings and lifecycle.

use serde::{Deserialize, Serialize};

use crate::GridError;

/// Identity of one incarnation of a region.
///
/// Destroying a region and creating another with the same name yields a
/// different `serial`, so messages aimed at the old region cannot touch
/// the new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId {
    pub name: String,
    pub serial: u64,
}

impl RegionId {
    pub fn new(name: impl Into<String>, serial: u64) -> Self {
        Self {
            name: name.into(),
            serial,
        }
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.serial)
    }
}

/// Region lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionState {
    Creating,
    Active,
    Destroying,
    Destroyed,
}

impl std::fmt::Display for RegionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionState::Creating => write!(f, "creating"),
            RegionState::Active => write!(f, "active"),
            RegionState::Destroying => write!(f, "destroying"),
            RegionState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// How many secondary acknowledgments a write needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every secondary recorded when the write was accepted.
    #[default]
    All,
    /// A strict majority of those secondaries.
    Majority,
    /// A fixed count, capped at the number of secondaries.
    Count(u32),
}

impl QuorumPolicy {
    /// Acknowledgments required given `secondaries` targets.
    pub fn required(&self, secondaries: usize) -> usize {
        match *self {
            QuorumPolicy::All => secondaries,
            QuorumPolicy::Majority => {
                if secondaries == 0 {
                    0
                } else {
                    secondaries / 2 + 1
                }
            }
            QuorumPolicy::Count(n) => (n as usize).min(secondaries),
        }
    }
}

/// Which owners may serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    #[default]
    Primary,
    /// Any primary or secondary; may observe slightly stale data.
    AnyOwner,
}

/// Settings fixed when a region is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Number of buckets B. Never changes after creation.
    pub bucket_count: u32,
    /// Number of secondary copies R per bucket.
    pub redundancy: u32,
    #[serde(default)]
    pub quorum: QuorumPolicy,
    #[serde(default)]
    pub read_policy: ReadPolicy,
}

/// Upper bound on buckets per region.
pub const MAX_BUCKETS: u32 = 65_536;

impl RegionConfig {
    /// A region with default quorum and read policies.
    pub fn new(name: impl Into<String>, bucket_count: u32, redundancy: u32) -> Self {
        Self {
            name: name.into(),
            bucket_count,
            redundancy,
            quorum: QuorumPolicy::default(),
            read_policy: ReadPolicy::default(),
        }
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_read_policy(mut self, read_policy: ReadPolicy) -> Self {
        self.read_policy = read_policy;
        self
    }

    pub fn validate(&self) -> Result<(), GridError> {
        if self.name.is_empty() {
            return Err(GridError::InvalidRegionConfig(
                "region name must not be empty".into(),
            ));
        }
        if self.bucket_count == 0 || self.bucket_count > MAX_BUCKETS {
            return Err(GridError::InvalidRegionConfig(format!(
                "bucket count must be in 1..={MAX_BUCKETS}, got {}",
                self.bucket_count
            )));
        }
        Ok(())
    }
}
