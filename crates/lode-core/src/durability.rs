//! Durability hook.
//!
//! The grid keeps data in memory; a member may additionally persist every
//! write its primaries accept. The hook runs inside the bucket actor before
//! the write is applied, so a write that fails to persist is never applied
//! or replicated.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use lode_cluster::{RegionId, ReplicatedEntry};

/// Called synchronously for every write accepted by a local primary.
pub trait DurabilityHook: Send + Sync + 'static {
    fn persist(&self, region: &RegionId, bucket: u32, entry: &ReplicatedEntry) -> io::Result<()>;
}

/// An in-memory journal of persisted writes.
///
/// Useful as a reference hook and for observing write order. Can be told
/// to fail, simulating a full or broken disk.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<(RegionId, u32, ReplicatedEntry)>>,
    failing: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `persist` calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out everything journalled so far, in persist order.
    pub fn records(&self) -> Vec<(RegionId, u32, ReplicatedEntry)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl DurabilityHook for MemoryJournal {
    fn persist(&self, region: &RegionId, bucket: u32, entry: &ReplicatedEntry) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("journal unavailable"));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| io::Error::other("journal lock poisoned"))?;
        records.push((region.clone(), bucket, entry.clone()));
        Ok(())
    }
}
