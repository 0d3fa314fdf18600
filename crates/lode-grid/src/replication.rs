//! Write replication.
//!
//! A primary's bucket actor stamps each write and hands it to the
//! [`ReplicationCoordinator`], which sends one `ReplicateApply` per
//! secondary and parks a channel for the acknowledgments. The writer then
//! waits on that channel with a deadline in [`await_quorum`]; there is no
//! callback nesting, only a task and its result channel.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lode_cluster::{
    Envelope, GridError, GridMessage, MemberId, RegionId, ReplicaOutcome, ReplicateApply,
    ReplicatedEntry, Secondaries, View, WriteAck,
};
use lode_core::{Accepted, ReplicaSink, Shipment};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Ships accepted writes to secondaries and routes their acks back.
pub struct ReplicationCoordinator {
    local: MemberId,
    local_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    views: watch::Receiver<Arc<View>>,
    next_ack: AtomicU64,
    pending: DashMap<u64, mpsc::UnboundedSender<(MemberId, ReplicaOutcome)>>,
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("local", &self.local)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ReplicationCoordinator {
    pub fn new(
        local: MemberId,
        local_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        views: watch::Receiver<Arc<View>>,
    ) -> Self {
        Self {
            local,
            local_addr,
            transport,
            views,
            next_ack: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// Routes a secondary's acknowledgment to the waiting write.
    pub fn deliver(&self, ack_id: u64, from: MemberId, outcome: ReplicaOutcome) {
        let closed = match self.pending.get(&ack_id) {
            Some(tx) => tx.send((from, outcome)).is_err(),
            None => {
                debug!(ack_id, %from, "ack for a write no longer waiting");
                false
            }
        };
        if closed {
            self.pending.remove(&ack_id);
        }
    }

    /// Drops ack channels whose writer stopped waiting.
    pub fn sweep(&self) {
        self.pending.retain(|_, tx| !tx.is_closed());
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl ReplicaSink for ReplicationCoordinator {
    /// Sends the entry to every target in the current view. A target the
    /// view no longer holds is skipped; it is not counted toward the quorum.
    fn replicate(
        &self,
        region: &RegionId,
        bucket: u32,
        epoch: u64,
        targets: &[MemberId],
        entry: &ReplicatedEntry,
    ) -> Shipment {
        let (tx, acks) = mpsc::unbounded_channel();
        let view = self.views.borrow().clone();
        let live: Vec<(MemberId, SocketAddr)> = targets
            .iter()
            .filter_map(|target| match view.addr_of(*target) {
                Some(addr) => Some((*target, addr)),
                None => {
                    debug!(region = %region, bucket, secondary = %target, "secondary not in view, skipping");
                    None
                }
            })
            .collect();
        if live.is_empty() {
            return Shipment {
                targets: Secondaries::new(),
                acks,
            };
        }
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.insert(ack_id, tx);

        for (target, addr) in &live {
            let msg = GridMessage::ReplicateApply(ReplicateApply {
                ack_id,
                region: region.clone(),
                bucket,
                epoch,
                entry: entry.clone(),
            });
            if let Err(e) = self
                .transport
                .send(*addr, Envelope::new(self.local, self.local_addr, msg))
            {
                debug!(region = %region, bucket, secondary = %target, "replicate send failed: {e}");
            }
        }
        counter!("lode_replicate_sent_total").increment(live.len() as u64);
        Shipment {
            targets: live.into_iter().map(|(id, _)| id).collect(),
            acks,
        }
    }
}

/// Waits until `required` distinct secondaries acknowledged the write, or
/// until `timeout` passes.
///
/// Gives up early once the outstanding secondaries can no longer make up
/// the quorum (they rejected the entry). A failure is ambiguous: the write
/// is applied at the primary and possibly at some secondaries.
pub async fn await_quorum(
    accepted: Accepted,
    required: usize,
    degraded: bool,
    timeout: Duration,
) -> Result<WriteAck, GridError> {
    let Accepted {
        stamp,
        targets,
        mut acks,
        ..
    } = accepted;
    let deadline = Instant::now() + timeout;
    let mut acked: HashSet<MemberId> = HashSet::new();
    let mut rejected: HashSet<MemberId> = HashSet::new();

    while acked.len() < required {
        match tokio::time::timeout_at(deadline, acks.recv()).await {
            Ok(Some((member, outcome))) => {
                // redelivered replications can answer twice; the first
                // outcome per member stands
                if !targets.contains(&member) || acked.contains(&member) || rejected.contains(&member) {
                    continue;
                }
                match outcome {
                    ReplicaOutcome::Rejected(e) => {
                        debug!(%member, %stamp, "secondary rejected entry: {e}");
                        rejected.insert(member);
                    }
                    _ => {
                        acked.insert(member);
                    }
                }
                let outstanding = targets.len() - acked.len() - rejected.len();
                if acked.len() + outstanding < required {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    if acked.len() >= required {
        Ok(WriteAck {
            stamp,
            acks: acked.len(),
            required,
            degraded,
        })
    } else {
        warn!(%stamp, acked = acked.len(), required, "write quorum not reached");
        counter!("lode_quorum_timeouts_total").increment(1);
        Err(GridError::QuorumTimeout {
            acked: acked.len(),
            required,
        })
    }
}
