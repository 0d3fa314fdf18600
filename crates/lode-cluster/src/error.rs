//! Error types for grid operations.
//!
//! `GridError` travels inside reply messages, so every variant carries
//! plain data (strings and ids) rather than source errors.

use serde::{Deserialize, Serialize};

use crate::region::RegionState;
use crate::MemberId;

/// Errors surfaced by membership, routing, replication and directory
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GridError {
    /// The target member does not own the bucket (any more).
    #[error("member {member} does not own bucket {bucket} of region '{region}'")]
    NotOwner {
        region: String,
        bucket: u32,
        member: MemberId,
    },

    /// The request referenced an ownership epoch the owner does not hold.
    #[error("stale epoch for bucket {bucket} of region '{region}': expected {expected}, got {got}")]
    StaleEpoch {
        region: String,
        bucket: u32,
        expected: u64,
        got: u64,
    },

    /// The write was applied at the primary but the required number of
    /// secondary acknowledgments did not arrive in time. The outcome is
    /// ambiguous: some secondaries may hold the entry.
    #[error("quorum timeout: {acked} of {required} secondary acknowledgments")]
    QuorumTimeout { acked: usize, required: usize },

    /// The bucket has no live owner able to serve the operation.
    #[error("bucket {bucket} of region '{region}' is degraded: no live primary")]
    Degraded { region: String, bucket: u32 },

    #[error("region '{0}' not found")]
    RegionNotFound(String),

    #[error("region '{0}' already exists")]
    RegionExists(String),

    /// The region exists but is being created or torn down.
    #[error("region '{name}' is {state}")]
    RegionNotActive { name: String, state: RegionState },

    #[error("invalid region configuration: {0}")]
    InvalidRegionConfig(String),

    /// The coordinator is unreachable; writes are suspended until a new
    /// view is installed.
    #[error("membership partitioned: coordinator unreachable")]
    MembershipPartitioned,

    /// The member could not complete a coordinator re-election in time and
    /// refuses to serve data.
    #[error("member unavailable: {0}")]
    Unavailable(String),

    /// The router gave up after its bounded number of attempts.
    #[error("routing exhausted after {attempts} attempts: {last}")]
    RoutingExhausted { attempts: u32, last: String },

    /// The durability hook refused to log an accepted write.
    #[error("persistence hook failed: {0}")]
    Persistence(String),

    /// Message delivery failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived before the request deadline.
    #[error("request timed out")]
    Timeout,
}

impl GridError {
    /// Returns true for errors the router resolves by refreshing its
    /// directory snapshot and trying again.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            GridError::NotOwner { .. } | GridError::StaleEpoch { .. }
        )
    }

    /// Returns true when the write may or may not have taken effect.
    ///
    /// The core never retries these; callers retry, relying on version
    /// stamp deduplication.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, GridError::QuorumTimeout { .. } | GridError::Timeout)
    }

    /// Creates a `NotOwner` error.
    pub fn not_owner(region: impl Into<String>, bucket: u32, member: MemberId) -> Self {
        GridError::NotOwner {
            region: region.into(),
            bucket,
            member,
        }
    }

    /// Creates a `StaleEpoch` error.
    pub fn stale_epoch(region: impl Into<String>, bucket: u32, expected: u64, got: u64) -> Self {
        GridError::StaleEpoch {
            region: region.into(),
            bucket,
            expected,
            got,
        }
    }

    /// Creates a `Degraded` error.
    pub fn degraded(region: impl Into<String>, bucket: u32) -> Self {
        GridError::Degraded {
            region: region.into(),
            bucket,
        }
    }
}
