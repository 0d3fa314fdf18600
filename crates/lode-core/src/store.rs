//! The per-bucket entry store.
//!
//! Holds the latest version of every key in one bucket. Every mutation
//! carries a [`VersionStamp`] and is applied only if it is strictly newer
//! than what the store already holds, so replays, duplicates and
//! out-of-order deliveries all converge on the same state.
//!
//! Deletes are kept as tombstones so that a late, older write for a
//! deleted key is still recognised as stale.

use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;
use lode_cluster::{ReplicatedEntry, VersionStamp};

/// The current version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// `None` for a tombstone.
    pub value: Option<Bytes>,
    pub stamp: VersionStamp,
}

/// Result of [`EntryStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The store already holds `held`, which is equal or newer.
    Stale { held: VersionStamp },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Key-ordered store for one bucket.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: BTreeMap<Bytes, Entry>,
    tombstones: usize,
    max_sequence: u64,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `value` for `key` if `stamp` is newer than the held stamp.
    pub fn apply(&mut self, key: Bytes, value: Option<Bytes>, stamp: VersionStamp) -> ApplyOutcome {
        if let Some(held) = self.entries.get(&key) {
            if held.stamp >= stamp {
                return ApplyOutcome::Stale { held: held.stamp };
            }
        }
        self.max_sequence = self.max_sequence.max(stamp.sequence);
        let tombstone = value.is_none();
        let previous = self.entries.insert(key, Entry { value, stamp });
        let was_tombstone = previous.is_some_and(|p| p.value.is_none());
        match (was_tombstone, tombstone) {
            (false, true) => self.tombstones += 1,
            (true, false) => self.tombstones -= 1,
            _ => {}
        }
        ApplyOutcome::Applied
    }

    /// Applies a replicated entry.
    pub fn apply_entry(&mut self, entry: ReplicatedEntry) -> ApplyOutcome {
        self.apply(entry.key, entry.value, entry.stamp)
    }

    /// The held entry for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// The live value of `key`. Tombstones read as absent.
    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    /// Number of live (non-deleted) keys.
    pub fn len(&self) -> usize {
        self.entries.len() - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Highest sequence number of any stamp held. A newly promoted primary
    /// continues from here.
    pub fn max_sequence(&self) -> u64 {
        self.max_sequence
    }

    /// Newest stamp held for any key.
    pub fn max_stamp(&self) -> Option<VersionStamp> {
        self.entries.values().map(|e| e.stamp).max()
    }

    /// Starts a hand-off traversal over the whole bucket.
    ///
    /// The cursor is lazy: each chunk is read from the store when it is
    /// requested, so writes applied in between are picked up if their key
    /// sorts after the cursor. Writes behind the cursor reach the new owner
    /// through replication instead.
    pub fn snapshot_for_handoff(&self) -> HandoffCursor {
        HandoffCursor::default()
    }

    /// Up to `limit` entries with keys strictly after `after`.
    pub fn range_after(&self, after: Option<&Bytes>, limit: usize) -> Vec<ReplicatedEntry> {
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, e)| ReplicatedEntry {
                key: key.clone(),
                value: e.value.clone(),
                stamp: e.stamp,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Entry)> {
        self.entries.iter()
    }
}

/// One batch of a hand-off traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub entries: Vec<ReplicatedEntry>,
    /// No entries remain after this chunk.
    pub last: bool,
}

impl Chunk {
    /// Key of the final entry, where the next chunk resumes.
    pub fn last_key(&self) -> Option<Bytes> {
        self.entries.last().map(|e| e.key.clone())
    }
}

/// Position in a hand-off traversal.
///
/// Finite (it ends when the store has no keys after the cursor) and
/// restartable (a cursor is just the last acknowledged key, so a transfer
/// resumes from wherever the receiver confirmed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffCursor {
    position: Option<Bytes>,
}

impl HandoffCursor {
    /// A cursor resuming after `position`.
    pub fn resume_after(position: Option<Bytes>) -> Self {
        Self { position }
    }

    pub fn position(&self) -> Option<&Bytes> {
        self.position.as_ref()
    }

    /// Reads the next chunk without moving the cursor. Re-reading after a
    /// lost acknowledgment yields the same keys (or newer versions of them).
    pub fn next_chunk(&self, store: &EntryStore, limit: usize) -> Chunk {
        let limit = limit.max(1);
        let mut entries = store.range_after(self.position.as_ref(), limit + 1);
        let last = entries.len() <= limit;
        entries.truncate(limit);
        Chunk { entries, last }
    }

    /// Moves past a chunk the receiver acknowledged.
    pub fn advance(&mut self, chunk: &Chunk) {
        if let Some(key) = chunk.last_key() {
            self.position = Some(key);
        }
    }
}
