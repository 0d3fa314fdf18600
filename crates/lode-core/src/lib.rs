//! lode-core: per-bucket storage.
//!
//! Every bucket a member hosts is owned by one tokio task, the bucket
//! actor, which exclusively owns the bucket's [`EntryStore`]. Writes,
//! replicated entries, reads and hand-off chunks for a bucket are applied
//! serially in that task, so a bucket's history is totally ordered
//! without locks.

pub mod bucket;
pub mod durability;
pub mod error;
pub mod store;

pub use bucket::{
    spawn_bucket, Accepted, BucketConfig, BucketHandle, BucketRequest, BucketResponse,
    BucketStats, ReplicaAcks, ReplicaSink, Shipment,
};
pub use durability::{DurabilityHook, MemoryJournal};
pub use error::BucketError;
pub use store::{ApplyOutcome, Chunk, Entry, EntryStore, HandoffCursor};
