//! lode-cluster: membership and ownership metadata for the lode data grid.
//!
//! Everything in this crate is transport-agnostic. The grid runtime feeds
//! messages in and sends whatever comes out.
//!
//! # Architecture
//!
//! - **Membership**: a coordinator-driven view service with heartbeat
//!   failure detection and coordinator succession by election
//! - **Buckets**: keys hash to one of a region's fixed buckets
//! - **Allocation**: deterministic primary/secondary assignment, repair
//!   after view changes and growth rebalancing
//! - **Directory**: copy-on-write region metadata and ownership tables
//! - **Hand-off**: bookkeeping for bucket transfers between members
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lode_cluster::{allocator, bucket_for_key, Member, MemberId, RegionConfig, RegionId, View};
//!
//! let founder = Member::starting(MemberId::new(), "127.0.0.1:7400".parse().unwrap(), None);
//! let view = View::founding(founder);
//! let config = RegionConfig::new("orders", 4, 1);
//! let table = allocator::initial_assignment(RegionId::new("orders", 1), &config, &view).unwrap();
//!
//! let bucket = bucket_for_key(b"o1", config.bucket_count);
//! assert!(table.primary_of(bucket).is_some());
//! ```

pub mod allocator;
mod buckets;
mod directory;
mod election;
mod error;
mod handoff;
mod member;
mod membership;
mod message;
mod ownership;
mod region;
mod stamp;
mod view;

pub use allocator::{BucketMove, MoveKind, Reassignment};
pub use buckets::{bucket_for_key, routing_key};
pub use directory::{DirectorySnapshot, RegionDirectory, RegionEntry, Revision};
pub use election::Election;
pub use error::GridError;
pub use handoff::{Handoff, HandoffError, HandoffKey, HandoffManager, HandoffState};
pub use member::{Member, MemberId, MemberInfo, MemberStatus};
pub use membership::{
    ConsistencyMode, LocalStatus, MembershipConfig, MembershipEngine, MembershipEvent,
};
pub use message::{
    BucketSnapshotChunk, Envelope, GridMessage, ReadRequest, ReplicaOutcome, ReplicateApply,
    ReplicatedEntry, Request, Response, WriteAck, WriteForward, MAX_MESSAGE_SIZE,
};
pub use ownership::{
    BucketHealth, BucketOwnership, MemberIndex, OwnerRole, OwnershipTable, Secondaries,
};
pub use region::{QuorumPolicy, ReadPolicy, RegionConfig, RegionId, RegionState, MAX_BUCKETS};
pub use stamp::VersionStamp;
pub use view::{View, ViewChange};
