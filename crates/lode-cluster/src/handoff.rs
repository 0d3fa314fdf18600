//! Bucket hand-off bookkeeping.
//!
//! A hand-off copies one bucket from its primary to a member that was just
//! added to the bucket's owners. The protocol:
//!
//! 1. The coordinator publishes a table adding the target as an owner
//! 2. The primary streams snapshot chunks, each acknowledged by the target
//! 3. A chunk that times out is re-sent from the last acknowledged key
//! 4. After the final chunk the primary reports completion to the coordinator
//! 5. For primary moves the coordinator then freezes the old primary and
//!    publishes the swapped roles under a new epoch
//!
//! This module only tracks state; the grid runtime drives the transfers.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::member::MemberId;
use crate::region::RegionId;

/// Identifies one transfer: a bucket copied to one target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffKey {
    pub region: RegionId,
    pub bucket: u32,
    pub target: MemberId,
}

impl std::fmt::Display for HandoffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} -> {}", self.region, self.bucket, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffState {
    Streaming,
    /// Interrupted; a restart resumes after the last acknowledged key.
    Aborted,
    Complete,
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Aborted => write!(f, "aborted"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// An outgoing transfer.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub key: HandoffKey,
    /// Epoch of the bucket when the transfer (re)started.
    pub epoch: u64,
    pub state: HandoffState,
    pub started_at: Instant,
    /// Last key the target acknowledged. `None` until the first ack.
    pub resume_after: Option<Bytes>,
    pub entries_sent: u64,
    pub chunks_acked: u64,
    /// Consecutive timed-out attempts of the current chunk.
    pub retries: u32,
}

impl Handoff {
    fn new(key: HandoffKey, epoch: u64) -> Self {
        Self {
            key,
            epoch,
            state: HandoffState::Streaming,
            started_at: Instant::now(),
            resume_after: None,
            entries_sent: 0,
            chunks_acked: 0,
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("hand-off {0} already in progress")]
    AlreadyInProgress(HandoffKey),

    #[error("no hand-off {0} in progress")]
    NotInProgress(HandoffKey),
}

/// All transfers this member is involved in.
#[derive(Debug, Default)]
pub struct HandoffManager {
    outgoing: HashMap<HandoffKey, Handoff>,
    /// Entries received per incoming bucket, keyed by (region, bucket).
    incoming: HashMap<(RegionId, u32), u64>,
}

impl HandoffManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) streaming `key` at `epoch`.
    ///
    /// Restarting an aborted transfer keeps its resume position: the
    /// target still holds everything it acknowledged.
    pub fn start(&mut self, key: HandoffKey, epoch: u64) -> Result<&Handoff, HandoffError> {
        match self.outgoing.get_mut(&key) {
            Some(h) if h.state == HandoffState::Streaming => {
                return Err(HandoffError::AlreadyInProgress(key));
            }
            Some(h) => {
                h.state = HandoffState::Streaming;
                h.epoch = epoch;
                h.retries = 0;
            }
            None => {
                self.outgoing.insert(key.clone(), Handoff::new(key.clone(), epoch));
            }
        }
        self.outgoing
            .get(&key)
            .ok_or(HandoffError::NotInProgress(key))
    }

    pub fn get(&self, key: &HandoffKey) -> Option<&Handoff> {
        self.outgoing.get(key)
    }

    pub fn is_streaming(&self, key: &HandoffKey) -> bool {
        self.outgoing
            .get(key)
            .is_some_and(|h| h.state == HandoffState::Streaming)
    }

    /// Records an acknowledged chunk ending at `last_key`.
    pub fn record_ack(
        &mut self,
        key: &HandoffKey,
        entries: usize,
        last_key: Option<Bytes>,
    ) -> Result<(), HandoffError> {
        let h = self
            .outgoing
            .get_mut(key)
            .ok_or_else(|| HandoffError::NotInProgress(key.clone()))?;
        h.entries_sent += entries as u64;
        h.chunks_acked += 1;
        h.retries = 0;
        if last_key.is_some() {
            h.resume_after = last_key;
        }
        Ok(())
    }

    /// Records a timed-out chunk. Returns the number of consecutive retries.
    pub fn record_retry(&mut self, key: &HandoffKey) -> Result<u32, HandoffError> {
        let h = self
            .outgoing
            .get_mut(key)
            .ok_or_else(|| HandoffError::NotInProgress(key.clone()))?;
        h.retries += 1;
        Ok(h.retries)
    }

    /// Finishes a transfer and forgets it.
    pub fn complete(&mut self, key: &HandoffKey) -> Option<Handoff> {
        self.outgoing.remove(key).map(|mut h| {
            h.state = HandoffState::Complete;
            h
        })
    }

    /// Interrupts a transfer, keeping its resume position.
    pub fn abort(&mut self, key: &HandoffKey) -> Option<&Handoff> {
        let h = self.outgoing.get_mut(key)?;
        h.state = HandoffState::Aborted;
        Some(h)
    }

    /// Drops every transfer of `region` (the region was destroyed or this
    /// member no longer owns the bucket).
    pub fn forget_region(&mut self, region: &RegionId) {
        self.outgoing.retain(|k, _| &k.region != region);
        self.incoming.retain(|(r, _), _| r != region);
    }

    /// Drops transfers of `bucket` whose target is not in `owners`.
    pub fn retain_targets(&mut self, region: &RegionId, bucket: u32, owners: &[MemberId]) {
        self.outgoing.retain(|k, _| {
            &k.region != region || k.bucket != bucket || owners.contains(&k.target)
        });
    }

    /// Counts entries received for an incoming bucket.
    pub fn record_incoming(&mut self, region: &RegionId, bucket: u32, entries: usize) {
        *self.incoming.entry((region.clone(), bucket)).or_default() += entries as u64;
    }

    /// Finishes an incoming bucket, returning the entries received.
    pub fn finish_incoming(&mut self, region: &RegionId, bucket: u32) -> u64 {
        self.incoming
            .remove(&(region.clone(), bucket))
            .unwrap_or(0)
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &Handoff> {
        self.outgoing.values()
    }

    /// Transfers currently streaming.
    pub fn active_count(&self) -> usize {
        self.outgoing
            .values()
            .filter(|h| h.state == HandoffState::Streaming)
            .count()
    }

    /// Transfers of `region` currently streaming.
    pub fn active_in(&self, region: &RegionId) -> usize {
        self.outgoing
            .values()
            .filter(|h| h.state == HandoffState::Streaming && &h.key.region == region)
            .count()
    }
}
