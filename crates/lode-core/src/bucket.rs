//! Bucket actor: the single owner of one hosted bucket.
//!
//! Each hosted bucket runs as one tokio task that exclusively owns its
//! [`EntryStore`]. Writes, replicated entries, hand-off chunks and role
//! changes are processed strictly in arrival order, which gives the two
//! properties replication relies on:
//!
//! - a primary assigns stamps and hands entries to the [`ReplicaSink`] in
//!   one step, so secondaries receive a bucket's writes in stamp order
//! - a freeze request is ordered after every write accepted before it, so
//!   a hand-off can fence the old primary's history
//!
//! Callers talk to the task through a [`BucketHandle`]; every request
//! carries its own oneshot reply channel.

use std::sync::Arc;

use bytes::Bytes;
use lode_cluster::{
    GridError, MemberId, OwnerRole, RegionId, ReplicaOutcome, ReplicatedEntry, Secondaries,
    VersionStamp,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::durability::DurabilityHook;
use crate::error::BucketError;
use crate::store::{ApplyOutcome, Chunk, EntryStore, HandoffCursor};

/// Acknowledgments from secondaries for one write, as they arrive.
pub type ReplicaAcks = mpsc::UnboundedReceiver<(MemberId, ReplicaOutcome)>;

/// Where one accepted write went.
#[derive(Debug)]
pub struct Shipment {
    /// The secondaries the entry was sent to. Targets the sink knows to be
    /// gone are left out and can never acknowledge.
    pub targets: Secondaries,
    pub acks: ReplicaAcks,
}

/// Ships accepted writes to secondaries.
///
/// Called from inside the bucket task, so calls for one bucket happen in
/// stamp order. Implementations must not block: they hand the entry to
/// the transport and return a channel on which acknowledgments arrive.
pub trait ReplicaSink: Send + Sync + 'static {
    fn replicate(
        &self,
        region: &RegionId,
        bucket: u32,
        epoch: u64,
        targets: &[MemberId],
        entry: &ReplicatedEntry,
    ) -> Shipment;
}

/// Everything a bucket task needs at startup.
pub struct BucketConfig {
    pub region: RegionId,
    pub bucket: u32,
    pub member: MemberId,
    /// The local member's incarnation, stamped into every write.
    pub incarnation: u64,
    pub role: OwnerRole,
    pub secondaries: Secondaries,
    pub durability: Option<Arc<dyn DurabilityHook>>,
    pub sink: Arc<dyn ReplicaSink>,
}

#[derive(Debug)]
pub enum BucketRequest {
    /// A client write (or delete, when `value` is `None`). Only a primary
    /// at exactly `epoch` accepts it.
    Write {
        key: Bytes,
        value: Option<Bytes>,
        epoch: u64,
    },
    /// An entry accepted by the primary of `epoch`.
    Replicate { epoch: u64, entry: ReplicatedEntry },
    Read {
        key: Bytes,
        /// Epoch from the caller's directory snapshot, checked if given.
        epoch: Option<u64>,
        primary_only: bool,
    },
    /// Reads the hand-off chunk after `after`.
    Chunk { after: Option<Bytes>, limit: usize },
    /// Applies a hand-off chunk from the primary of `epoch`.
    ApplyChunk {
        epoch: u64,
        entries: Vec<ReplicatedEntry>,
    },
    SetRole {
        role: OwnerRole,
        secondaries: Secondaries,
    },
    /// Stops accepting writes at `epoch` ahead of a primary hand-off.
    /// Lifted by the next role change to a newer epoch.
    Freeze { epoch: u64 },
    Stats,
}

/// A write accepted by a primary, waiting for secondary acknowledgments.
#[derive(Debug)]
pub struct Accepted {
    pub stamp: VersionStamp,
    /// Secondaries the write was shipped to.
    pub targets: Secondaries,
    /// Assigned secondaries the write could not be shipped to.
    pub skipped: usize,
    pub acks: ReplicaAcks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub role: OwnerRole,
    pub frozen: bool,
    pub entries: usize,
    pub tombstones: usize,
    pub high_water: Option<VersionStamp>,
}

#[derive(Debug)]
pub enum BucketResponse {
    Accepted(Accepted),
    Replicated(ReplicaOutcome),
    Value(Option<Bytes>),
    Chunk(Chunk),
    ChunkApplied(usize),
    /// The bucket is frozen; carries the newest stamp it holds.
    Frozen(VersionStamp),
    Stats(BucketStats),
    Ok,
    Err(GridError),
}

#[derive(Debug)]
struct BucketMessage {
    request: BucketRequest,
    reply: oneshot::Sender<BucketResponse>,
}

/// A cloneable handle for sending requests to a bucket task.
///
/// The task stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct BucketHandle {
    tx: mpsc::Sender<BucketMessage>,
}

impl BucketHandle {
    /// Sends a request and waits for the response.
    ///
    /// Returns `BucketError::Unavailable` if the bucket task has stopped.
    pub async fn send(&self, request: BucketRequest) -> Result<BucketResponse, BucketError> {
        let rx = self.dispatch(request).await?;
        rx.await.map_err(|_| BucketError::Unavailable)
    }

    /// Queues a request and returns the reply channel without waiting for
    /// the response. Requests queued from one caller are processed in the
    /// order they were dispatched.
    pub async fn dispatch(
        &self,
        request: BucketRequest,
    ) -> Result<oneshot::Receiver<BucketResponse>, BucketError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BucketMessage { request, reply })
            .await
            .map_err(|_| BucketError::Unavailable)?;
        Ok(rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns a bucket task on the current runtime.
///
/// `buffer` bounds the request queue; a full queue makes callers wait,
/// pushing back on whoever is flooding the bucket.
pub fn spawn_bucket(buffer: usize, config: BucketConfig) -> BucketHandle {
    let (tx, rx) = mpsc::channel(buffer);
    tokio::spawn(run_bucket(rx, Bucket::new(config)));
    BucketHandle { tx }
}

async fn run_bucket(mut rx: mpsc::Receiver<BucketMessage>, mut bucket: Bucket) {
    debug!(region = %bucket.region, bucket = bucket.bucket, role = %bucket.role, "bucket started");
    while let Some(msg) = rx.recv().await {
        let response = bucket.handle(msg.request);
        // the caller may have given up waiting; nothing to do then
        let _ = msg.reply.send(response);
    }
    debug!(region = %bucket.region, bucket = bucket.bucket, "bucket stopped");
}

struct Bucket {
    region: RegionId,
    bucket: u32,
    member: MemberId,
    incarnation: u64,
    role: OwnerRole,
    secondaries: Secondaries,
    durability: Option<Arc<dyn DurabilityHook>>,
    sink: Arc<dyn ReplicaSink>,
    store: EntryStore,
    /// Last sequence this member stamped for the bucket.
    sequence: u64,
    frozen: bool,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            region: config.region,
            bucket: config.bucket,
            member: config.member,
            incarnation: config.incarnation,
            role: config.role,
            secondaries: config.secondaries,
            durability: config.durability,
            sink: config.sink,
            store: EntryStore::new(),
            sequence: 0,
            frozen: false,
        }
    }

    fn handle(&mut self, request: BucketRequest) -> BucketResponse {
        match request {
            BucketRequest::Write { key, value, epoch } => match self.write(key, value, epoch) {
                Ok(accepted) => BucketResponse::Accepted(accepted),
                Err(e) => BucketResponse::Err(e),
            },
            BucketRequest::Replicate { epoch, entry } => {
                BucketResponse::Replicated(self.replicate(epoch, entry))
            }
            BucketRequest::Read {
                key,
                epoch,
                primary_only,
            } => match self.read(&key, epoch, primary_only) {
                Ok(value) => BucketResponse::Value(value),
                Err(e) => BucketResponse::Err(e),
            },
            BucketRequest::Chunk { after, limit } => {
                if !self.role.is_owner() {
                    return BucketResponse::Err(self.not_owner());
                }
                BucketResponse::Chunk(HandoffCursor::resume_after(after).next_chunk(&self.store, limit))
            }
            BucketRequest::ApplyChunk { epoch, entries } => match self.apply_chunk(epoch, entries) {
                Ok(applied) => BucketResponse::ChunkApplied(applied),
                Err(e) => BucketResponse::Err(e),
            },
            BucketRequest::SetRole { role, secondaries } => {
                self.set_role(role, secondaries);
                BucketResponse::Ok
            }
            BucketRequest::Freeze { epoch } => match self.role {
                OwnerRole::PrimaryFor { epoch: current, .. } if current == epoch => {
                    self.frozen = true;
                    info!(region = %self.region, bucket = self.bucket, epoch, "bucket frozen for hand-off");
                    BucketResponse::Frozen(self.store.max_stamp().unwrap_or_default())
                }
                OwnerRole::PrimaryFor { epoch: current, .. } => BucketResponse::Err(
                    GridError::stale_epoch(self.region.name.clone(), self.bucket, current, epoch),
                ),
                _ => BucketResponse::Err(self.not_owner()),
            },
            BucketRequest::Stats => BucketResponse::Stats(BucketStats {
                role: self.role,
                frozen: self.frozen,
                entries: self.store.len(),
                tombstones: self.store.tombstones(),
                high_water: self.store.max_stamp(),
            }),
        }
    }

    fn write(&mut self, key: Bytes, value: Option<Bytes>, epoch: u64) -> Result<Accepted, GridError> {
        let current = match self.role {
            OwnerRole::PrimaryFor { epoch, .. } if !self.frozen => epoch,
            _ => return Err(self.not_owner()),
        };
        if epoch != current {
            return Err(GridError::stale_epoch(
                self.region.name.clone(),
                self.bucket,
                current,
                epoch,
            ));
        }

        self.sequence = self.sequence.max(self.store.max_sequence()) + 1;
        let entry = ReplicatedEntry {
            key,
            value,
            stamp: VersionStamp::new(current, self.sequence, self.incarnation),
        };
        if let Some(hook) = &self.durability {
            hook.persist(&self.region, self.bucket, &entry)
                .map_err(|e| GridError::Persistence(e.to_string()))?;
        }
        let stamp = entry.stamp;
        if let ApplyOutcome::Stale { held } = self.store.apply(entry.key.clone(), entry.value.clone(), stamp) {
            // only possible if a newer epoch's history reached us first
            warn!(region = %self.region, bucket = self.bucket, %stamp, %held, "primary write superseded locally");
        }
        let shipment = self
            .sink
            .replicate(&self.region, self.bucket, current, &self.secondaries, &entry);
        Ok(Accepted {
            stamp,
            skipped: self.secondaries.len().saturating_sub(shipment.targets.len()),
            targets: shipment.targets,
            acks: shipment.acks,
        })
    }

    fn replicate(&mut self, epoch: u64, entry: ReplicatedEntry) -> ReplicaOutcome {
        if let Err(e) = self.check_incoming_epoch(epoch) {
            return ReplicaOutcome::Rejected(e);
        }
        match self.store.apply_entry(entry) {
            ApplyOutcome::Applied => ReplicaOutcome::Applied,
            ApplyOutcome::Stale { .. } => ReplicaOutcome::AlreadyHeld,
        }
    }

    fn apply_chunk(&mut self, epoch: u64, entries: Vec<ReplicatedEntry>) -> Result<usize, GridError> {
        self.check_incoming_epoch(epoch)?;
        Ok(entries
            .into_iter()
            .map(|e| self.store.apply_entry(e))
            .filter(ApplyOutcome::is_applied)
            .count())
    }

    /// Entries from an older epoch's primary are refused. Entries from a
    /// newer epoch are taken: the sender is the primary of an ownership
    /// table this member has not installed yet.
    fn check_incoming_epoch(&self, epoch: u64) -> Result<(), GridError> {
        match self.role.epoch() {
            None => Err(self.not_owner()),
            Some(current) if epoch < current => Err(GridError::stale_epoch(
                self.region.name.clone(),
                self.bucket,
                current,
                epoch,
            )),
            Some(_) => Ok(()),
        }
    }

    fn read(&self, key: &[u8], epoch: Option<u64>, primary_only: bool) -> Result<Option<Bytes>, GridError> {
        if !self.role.is_owner() || (primary_only && !self.role.is_primary()) {
            return Err(self.not_owner());
        }
        if let (Some(expected), Some(got)) = (self.role.epoch(), epoch) {
            if expected != got {
                return Err(GridError::stale_epoch(
                    self.region.name.clone(),
                    self.bucket,
                    expected,
                    got,
                ));
            }
        }
        Ok(self.store.value(key))
    }

    fn set_role(&mut self, role: OwnerRole, secondaries: Secondaries) {
        if role.epoch() > self.role.epoch() {
            self.frozen = false;
        }
        if role != self.role {
            if role.is_primary() && !self.role.is_primary() {
                info!(region = %self.region, bucket = self.bucket, %role, "promoted to primary");
            } else {
                debug!(region = %self.region, bucket = self.bucket, from = %self.role, to = %role, "bucket role changed");
            }
        }
        self.role = role;
        self.secondaries = secondaries;
    }

    fn not_owner(&self) -> GridError {
        GridError::not_owner(self.region.name.clone(), self.bucket, self.member)
    }
}
