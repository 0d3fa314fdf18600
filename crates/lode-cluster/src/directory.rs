//! Region directory.
//!
//! Maps region names to their metadata and current ownership table. The
//! directory is published copy-on-write through a `watch` channel: every
//! change builds a new [`DirectorySnapshot`] and swaps it in, so readers
//! holding an `Arc` keep a consistent point-in-time view and never block
//! the writer of the next one.
//!
//! Only the view coordinator originates changes (region lifecycle calls
//! and allocator output). Every other member installs what the
//! coordinator broadcasts, keeping an entry only if its [`Revision`] is
//! newer than the one already held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::allocator;
use crate::ownership::{BucketOwnership, OwnershipTable};
use crate::region::{RegionConfig, RegionId, RegionState};
use crate::view::View;
use crate::GridError;

/// Publication order of directory changes.
///
/// The view generation comes first: a coordinator elected in a later view
/// always publishes revisions newer than anything its predecessor did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision {
    pub generation: u64,
    pub seq: u64,
}

impl Revision {
    /// The revision following `self` when publishing under `generation`.
    pub fn next(self, generation: u64) -> Revision {
        if generation > self.generation {
            Revision { generation, seq: 1 }
        } else {
            Revision {
                generation: self.generation,
                seq: self.seq + 1,
            }
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.generation, self.seq)
    }
}

/// Everything the grid knows about one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub id: RegionId,
    pub config: RegionConfig,
    pub state: RegionState,
    pub table: Arc<OwnershipTable>,
    pub revision: Revision,
}

impl RegionEntry {
    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn is_active(&self) -> bool {
        self.state == RegionState::Active
    }

    fn with_state(&self, state: RegionState, revision: Revision) -> RegionEntry {
        RegionEntry {
            state,
            revision,
            ..self.clone()
        }
    }

    fn with_table(&self, table: OwnershipTable, revision: Revision) -> RegionEntry {
        RegionEntry {
            table: Arc::new(table),
            revision,
            ..self.clone()
        }
    }
}

/// An immutable point-in-time view of the directory.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub revision: Revision,
    regions: HashMap<String, Arc<RegionEntry>>,
    /// Regions destroyed since this member started; late updates for them
    /// are ignored.
    retired: HashSet<RegionId>,
}

impl DirectorySnapshot {
    pub fn region(&self, name: &str) -> Option<&Arc<RegionEntry>> {
        self.regions.get(name)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Arc<RegionEntry>> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn is_retired(&self, id: &RegionId) -> bool {
        self.retired.contains(id)
    }

    pub fn retired(&self) -> impl Iterator<Item = &RegionId> {
        self.retired.iter()
    }

    /// A copy of this snapshot with `entry` stored under its name.
    fn with_entry(&self, entry: RegionEntry) -> DirectorySnapshot {
        let mut next = self.clone();
        next.revision = next.revision.max(entry.revision);
        next.regions.insert(entry.name().to_string(), Arc::new(entry));
        next
    }
}

/// The member-local directory handle.
#[derive(Debug)]
pub struct RegionDirectory {
    tx: watch::Sender<Arc<DirectorySnapshot>>,
}

impl Default for RegionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionDirectory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(DirectorySnapshot::default()));
        Self { tx }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<DirectorySnapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribes to directory publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DirectorySnapshot>> {
        self.tx.subscribe()
    }

    pub fn entry(&self, name: &str) -> Option<Arc<RegionEntry>> {
        self.current().region(name).cloned()
    }

    /// The current ownership table of `name`.
    pub fn snapshot(&self, name: &str) -> Result<Arc<OwnershipTable>, GridError> {
        self.entry(name)
            .map(|e| Arc::clone(&e.table))
            .ok_or_else(|| GridError::RegionNotFound(name.to_string()))
    }

    /// Coordinator: allocates a new region over `view` in the `Creating`
    /// state and publishes it.
    pub fn create_region(&self, config: RegionConfig, view: &View) -> Result<RegionEntry, GridError> {
        config.validate()?;
        let mut result = Err(GridError::RegionExists(config.name.clone()));
        self.tx.send_if_modified(|snap| {
            if snap.region(&config.name).is_some() {
                return false;
            }
            let revision = snap.revision.next(view.generation);
            // the revision is unique across coordinators, so it doubles as
            // the serial distinguishing reused names
            let id = RegionId::new(config.name.clone(), (revision.generation << 32) | revision.seq);
            let table = match allocator::initial_assignment(id.clone(), &config, view) {
                Ok(table) => table,
                Err(e) => {
                    result = Err(e);
                    return false;
                }
            };
            let entry = RegionEntry {
                id,
                config: config.clone(),
                state: RegionState::Creating,
                table: Arc::new(table),
                revision,
            };
            *snap = Arc::new(snap.with_entry(entry.clone()));
            result = Ok(entry);
            true
        });
        if let Ok(entry) = &result {
            info!(region = %entry.id, buckets = entry.config.bucket_count, redundancy = entry.config.redundancy, "region allocated");
        }
        result
    }

    /// Coordinator: moves a region to a new lifecycle state.
    pub fn set_state(
        &self,
        name: &str,
        state: RegionState,
        generation: u64,
    ) -> Result<RegionEntry, GridError> {
        let mut result = Err(GridError::RegionNotFound(name.to_string()));
        self.tx.send_if_modified(|snap| {
            let Some(existing) = snap.region(name) else {
                return false;
            };
            let entry = existing.with_state(state, snap.revision.next(generation));
            *snap = Arc::new(snap.with_entry(entry.clone()));
            result = Ok(entry);
            true
        });
        if let Ok(entry) = &result {
            debug!(region = %entry.id, %state, "region state changed");
        }
        result
    }

    /// Coordinator: marks a region as being destroyed. Members stop
    /// serving it as soon as they install the `Destroying` entry.
    pub fn destroy_region(&self, name: &str, generation: u64) -> Result<RegionEntry, GridError> {
        match self.entry(name) {
            None => Err(GridError::RegionNotFound(name.to_string())),
            Some(e) if e.state == RegionState::Destroying => Ok(RegionEntry::clone(&e)),
            Some(_) => self.set_state(name, RegionState::Destroying, generation),
        }
    }

    /// Coordinator: replaces the ownership of one bucket.
    ///
    /// `ownership` must have been derived from the slot at `expected_epoch`
    /// and carry a newer epoch. If the slot has moved on since (a repair
    /// landed while the caller was waiting on a hand-off), nothing is
    /// published and [`GridError::StaleEpoch`] is returned.
    ///
    /// Returns the entry that was replaced and the one published.
    pub fn publish_bucket(
        &self,
        name: &str,
        bucket: u32,
        expected_epoch: u64,
        ownership: BucketOwnership,
        generation: u64,
    ) -> Result<(Arc<RegionEntry>, RegionEntry), GridError> {
        let mut result = Err(GridError::RegionNotFound(name.to_string()));
        let mut ownership = Some(ownership);
        self.tx.send_if_modified(|snap| {
            let (Some(existing), Some(ownership)) = (snap.region(name), ownership.take()) else {
                return false;
            };
            if !existing.is_active() {
                result = Err(GridError::RegionNotActive {
                    name: name.to_string(),
                    state: existing.state,
                });
                return false;
            }
            let Some(slot) = existing.table.bucket(bucket) else {
                result = Err(GridError::degraded(name, bucket));
                return false;
            };
            if slot.epoch != expected_epoch || ownership.epoch <= slot.epoch {
                result = Err(GridError::stale_epoch(name, bucket, slot.epoch, expected_epoch));
                return false;
            }
            let mut buckets = existing.table.buckets().to_vec();
            buckets[bucket as usize] = ownership;
            let table = existing.table.successor(generation, buckets);
            let entry = existing.with_table(table, snap.revision.next(generation));
            let previous = Arc::clone(existing);
            *snap = Arc::new(snap.with_entry(entry.clone()));
            result = Ok((previous, entry));
            true
        });
        if let Err(e) = &result {
            debug!(region = name, bucket, expected_epoch, "bucket publication refused: {e}");
        }
        result
    }

    /// Coordinator: repairs every region's ownership after a view change.
    ///
    /// Returns the entries that changed so they can be broadcast.
    pub fn reassign_all(&self, old_view: &View, new_view: &View) -> Vec<RegionEntry> {
        let mut changed = Vec::new();
        self.tx.send_if_modified(|snap| {
            let mut next = DirectorySnapshot::clone(snap);
            for existing in snap.regions() {
                if matches!(
                    existing.state,
                    RegionState::Destroying | RegionState::Destroyed
                ) {
                    continue;
                }
                let r = allocator::reassign(&existing.table, old_view, new_view);
                for bucket in &r.lost {
                    warn!(region = %existing.id, bucket, "bucket degraded: no surviving owner");
                }
                if r.is_unchanged() {
                    continue;
                }
                info!(
                    region = %existing.id,
                    changed = r.changed.len(),
                    promoted = r.promoted.len(),
                    "bucket ownership reassigned"
                );
                let entry = existing.with_table(r.table, next.revision.next(new_view.generation));
                next = next.with_entry(entry.clone());
                changed.push(entry);
            }
            if changed.is_empty() {
                return false;
            }
            *snap = Arc::new(next);
            true
        });
        changed
    }

    /// Coordinator: removes a destroyed region and remembers its id.
    ///
    /// Returns the revision to broadcast, or `None` if `id` is not the
    /// current incarnation of its name.
    pub fn retire(&self, id: &RegionId, generation: u64) -> Option<Revision> {
        let mut retired = None;
        self.tx.send_if_modified(|snap| {
            if snap.region(&id.name).map(|e| &e.id) != Some(id) {
                return false;
            }
            let revision = snap.revision.next(generation);
            let mut next = DirectorySnapshot::clone(snap);
            next.regions.remove(&id.name);
            next.retired.insert(id.clone());
            next.revision = revision;
            *snap = Arc::new(next);
            retired = Some(revision);
            true
        });
        if retired.is_some() {
            info!(region = %id, "region retired");
        }
        retired
    }

    /// Installs an entry received from the coordinator if it is newer than
    /// what this member holds. Returns true if it was installed.
    pub fn install(&self, entry: RegionEntry) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.is_retired(&entry.id) {
                return false;
            }
            let mut next = DirectorySnapshot::clone(snap);
            if let Some(existing) = snap.region(entry.name()) {
                if existing.revision >= entry.revision {
                    return false;
                }
                // a newer region under the same name supersedes the old one
                if existing.id != entry.id {
                    next.retired.insert(existing.id.clone());
                }
            }
            next.revision = next.revision.max(entry.revision);
            next.regions.insert(entry.name().to_string(), Arc::new(entry));
            *snap = Arc::new(next);
            true
        })
    }

    /// Records that the coordinator retired `id` at `revision`.
    pub fn install_retirement(&self, id: &RegionId, revision: Revision) -> bool {
        self.tx.send_if_modified(|snap| {
            if snap.is_retired(id) {
                return false;
            }
            let mut next = DirectorySnapshot::clone(snap);
            if next.regions.get(&id.name).is_some_and(|e| &e.id == id) {
                next.regions.remove(&id.name);
            }
            next.retired.insert(id.clone());
            next.revision = next.revision.max(revision);
            *snap = Arc::new(next);
            true
        })
    }
}
