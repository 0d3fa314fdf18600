//! Messages exchanged between grid members.
//!
//! Every message travels in an [`Envelope`] naming the sender. Payloads
//! are encoded with bincode: compact and fast for the numeric-heavy
//! ownership and stamp fields.
//!
//! Most traffic is one-way (heartbeats, view updates, replication). Calls
//! that need an answer use [`GridMessage::Request`] and are answered by a
//! [`GridMessage::Response`] carrying the same id.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::directory::{RegionEntry, Revision};
use crate::member::{MemberId, MemberInfo};
use crate::region::{RegionConfig, RegionId};
use crate::stamp::VersionStamp;
use crate::view::View;
use crate::GridError;

/// Upper bound on an encoded envelope. Snapshot chunks are the largest
/// messages; anything bigger is a bug or a hostile peer.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A message plus the identity of its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    pub from_addr: SocketAddr,
    pub message: GridMessage,
}

impl Envelope {
    pub fn new(from: MemberId, from_addr: SocketAddr, message: GridMessage) -> Self {
        Self {
            from,
            from_addr,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, GridError> {
        let buf = bincode::serialize(self).map_err(|e| GridError::Transport(e.to_string()))?;
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(GridError::Transport(format!(
                "message size {} exceeds limit {MAX_MESSAGE_SIZE}",
                buf.len()
            )));
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, GridError> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(GridError::Transport(format!(
                "message size {} exceeds limit {MAX_MESSAGE_SIZE}",
                buf.len()
            )));
        }
        bincode::deserialize(buf).map_err(|e| GridError::Transport(e.to_string()))
    }
}

/// An entry as shipped to another owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub key: Bytes,
    /// `None` is a delete.
    pub value: Option<Bytes>,
    pub stamp: VersionStamp,
}

/// How a secondary handled a replicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaOutcome {
    Applied,
    /// The secondary already held this stamp or a newer one for the key.
    AlreadyHeld,
    Rejected(GridError),
}

impl ReplicaOutcome {
    /// True if the acknowledgment counts toward the write quorum.
    pub fn counts(&self) -> bool {
        matches!(self, ReplicaOutcome::Applied | ReplicaOutcome::AlreadyHeld)
    }
}

/// Primary to secondary: apply one accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateApply {
    /// Correlates the acknowledgment with the waiting write.
    pub ack_id: u64,
    pub region: RegionId,
    pub bucket: u32,
    pub epoch: u64,
    pub entry: ReplicatedEntry,
}

/// A write sent to the bucket's primary by a member that is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteForward {
    pub region: RegionId,
    pub bucket: u32,
    /// Epoch of the bucket in the sender's directory snapshot.
    pub epoch: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub region: RegionId,
    pub bucket: u32,
    pub epoch: u64,
    pub key: Bytes,
}

/// One piece of a bucket being copied to a new owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshotChunk {
    pub region: RegionId,
    pub bucket: u32,
    pub epoch: u64,
    pub entries: Vec<ReplicatedEntry>,
    /// Set on the final chunk of a transfer.
    pub last: bool,
}

/// Successful outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub stamp: VersionStamp,
    /// Secondary acknowledgments received.
    pub acks: usize,
    /// Secondary acknowledgments the region's quorum policy required.
    pub required: usize,
    /// The bucket had fewer secondaries than its redundancy target.
    pub degraded: bool,
}

/// Calls that expect a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateRegion(RegionConfig),
    DestroyRegion { name: String },
    DirectoryFetch,
    DirectoryUpdate(RegionEntry),
    WriteForward(WriteForward),
    Read(ReadRequest),
    SnapshotChunk(BucketSnapshotChunk),
    /// Coordinator to old primary: stop accepting writes for the bucket and
    /// flush everything already accepted to `target`.
    HandoffFinalize {
        region: RegionId,
        bucket: u32,
        epoch: u64,
        target: MemberId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Created(Result<RegionEntry, GridError>),
    Destroyed(Result<(), GridError>),
    Directory {
        revision: Revision,
        entries: Vec<RegionEntry>,
        retired: Vec<RegionId>,
    },
    DirectoryAck,
    Write(Result<WriteAck, GridError>),
    Read(Result<Option<Bytes>, GridError>),
    /// Number of entries applied from the chunk.
    ChunkAck(Result<usize, GridError>),
    HandoffReady(Result<VersionStamp, GridError>),
}

/// All grid messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridMessage {
    /// Ask to be admitted. Sent to seeds; non-coordinators forward it.
    JoinRequest { member: MemberInfo },
    /// A newly published view.
    ViewUpdate { view: View },
    Heartbeat {
        generation: u64,
        /// Latest directory revision the sender holds.
        directory: Revision,
    },
    /// Graceful departure, sent to the coordinator.
    LeaveNotice { member: MemberId },
    /// A successor candidate asks for support to replace the coordinator
    /// of view `generation`.
    ElectionRequest { generation: u64 },
    ElectionVote { generation: u64, granted: bool },

    ReplicateApply(ReplicateApply),
    ReplicateAck { ack_id: u64, outcome: ReplicaOutcome },

    RegionRetired { id: RegionId, revision: Revision },
    /// Primary to coordinator: `target` now holds a full copy of the bucket.
    HandoffComplete {
        region: RegionId,
        bucket: u32,
        target: MemberId,
        epoch: u64,
    },

    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
}

impl GridMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            GridMessage::JoinRequest { .. } => "join-request",
            GridMessage::ViewUpdate { .. } => "view-update",
            GridMessage::Heartbeat { .. } => "heartbeat",
            GridMessage::LeaveNotice { .. } => "leave-notice",
            GridMessage::ElectionRequest { .. } => "election-request",
            GridMessage::ElectionVote { .. } => "election-vote",
            GridMessage::ReplicateApply(_) => "replicate-apply",
            GridMessage::ReplicateAck { .. } => "replicate-ack",
            GridMessage::RegionRetired { .. } => "region-retired",
            GridMessage::HandoffComplete { .. } => "handoff-complete",
            GridMessage::Request { .. } => "request",
            GridMessage::Response { .. } => "response",
        }
    }
}
