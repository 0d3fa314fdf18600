//! Member identity.
//!
//! A member is one running grid process. Its id is generated fresh on
//! every process start, so identifiers are never reused across
//! incarnations of the same host.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a grid member.
///
/// Wraps a UUID v4. Ordering is the UUID's byte ordering and is only used
/// as a deterministic tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    /// Generates a new random member ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a member ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form, like a git abbreviated hash
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Asked to join, not yet admitted by the coordinator.
    Starting,
    Alive,
    /// Missed enough heartbeats to be suspected, not yet removed.
    Suspect,
    Departed,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Starting => write!(f, "starting"),
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Suspect => write!(f, "suspect"),
            MemberStatus::Departed => write!(f, "departed"),
        }
    }
}

/// A member as recorded in a published view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub addr: SocketAddr,
    /// Assigned by the coordinator at admission. Strictly increases on
    /// every (re)join; the lowest incarnation in a view is the oldest member.
    pub incarnation: u64,
    pub status: MemberStatus,
    /// Optional redundancy zone. Copies of a bucket are spread across
    /// zones when possible.
    pub zone: Option<String>,
}

impl Member {
    /// Creates a member that has not been admitted yet.
    pub fn starting(id: MemberId, addr: SocketAddr, zone: Option<String>) -> Self {
        Self {
            id,
            addr,
            incarnation: 0,
            status: MemberStatus::Starting,
            zone,
        }
    }

    /// Sort key that puts the oldest member first.
    pub fn seniority(&self) -> (u64, MemberId) {
        (self.incarnation, self.id)
    }
}

/// What a joining member tells the coordinator about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub addr: SocketAddr,
    pub zone: Option<String>,
}

impl From<&Member> for MemberInfo {
    fn from(m: &Member) -> Self {
        Self {
            id: m.id,
            addr: m.addr,
            zone: m.zone.clone(),
        }
    }
}
