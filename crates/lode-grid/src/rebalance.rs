//! Growth rebalancing.
//!
//! When members join, the coordinator plans bucket moves that even out
//! load and executes them one at a time, pausing between moves so normal
//! traffic keeps priority. A move that needs data seeds the new copy
//! first (the target becomes an extra secondary while the primary streams
//! to it), then flips ownership with a single table publication. Moving a
//! primary also freezes the old one and fences the link, so the new
//! primary starts with every write the old one accepted.
//!
//! Any move whose preconditions no longer hold when its turn comes is
//! skipped and the remaining plan discarded; the next pass replans from
//! the current tables.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use lode_cluster::{allocator, BucketMove, GridError, HandoffKey, MoveKind, Request, Response};
use metrics::counter;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::handoff;
use crate::node::{unexpected, NodeInner};

/// A planned move and the region it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub region: String,
    #[serde(flatten)]
    pub step: BucketMove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceStatus {
    pub paused: bool,
    /// Moves planned but not started.
    pub pending: usize,
    pub in_flight: Option<PlannedMove>,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct State {
    paused: bool,
    plan: VecDeque<PlannedMove>,
    in_flight: Option<PlannedMove>,
    completed: u64,
    failed: u64,
}

/// Rebalance plan and progress. Only the coordinator executes moves, but
/// every member keeps the controls so a newly elected coordinator honors
/// a pause issued to it.
#[derive(Debug, Default)]
pub struct Rebalancer {
    state: Mutex<State>,
}

impl Rebalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Stops starting new moves. The plan is kept for `resume`.
    pub fn pause(&self) {
        self.with(|s| s.paused = true);
        info!("rebalance paused");
    }

    pub fn resume(&self) {
        self.with(|s| s.paused = false);
        info!("rebalance resumed");
    }

    /// Discards the plan and pauses.
    pub fn cancel(&self) {
        let dropped = self.with(|s| {
            s.paused = true;
            let n = s.plan.len();
            s.plan.clear();
            n
        });
        info!(dropped, "rebalance cancelled");
    }

    pub fn status(&self) -> RebalanceStatus {
        self.with(|s| RebalanceStatus {
            paused: s.paused,
            pending: s.plan.len(),
            in_flight: s.in_flight.clone(),
            completed: s.completed,
            failed: s.failed,
        })
    }

    fn is_paused(&self) -> bool {
        self.with(|s| s.paused)
    }

    fn needs_plan(&self) -> bool {
        self.with(|s| s.plan.is_empty())
    }

    fn load(&self, plan: Vec<PlannedMove>) {
        self.with(|s| s.plan = plan.into());
    }

    fn clear_plan(&self) {
        self.with(|s| s.plan.clear());
    }

    /// Takes the next move unless paused.
    fn begin_next(&self) -> Option<PlannedMove> {
        self.with(|s| {
            if s.paused {
                return None;
            }
            let next = s.plan.pop_front()?;
            s.in_flight = Some(next.clone());
            Some(next)
        })
    }

    fn skip(&self) {
        self.with(|s| s.in_flight = None);
    }

    fn finish(&self, succeeded: bool) {
        self.with(|s| {
            s.in_flight = None;
            if succeeded {
                s.completed += 1;
            } else {
                s.failed += 1;
            }
        });
    }
}

/// The coordinator's rebalance loop. Idles on every other member.
pub(crate) async fn run(node: Arc<NodeInner>) {
    let mut shutdown = node.shutdown_signal();
    let interval = node.config.rebalance.move_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if !node.config.rebalance.enabled || node.rebalancer.is_paused() {
            continue;
        }
        if !node.is_acting_coordinator().await {
            node.rebalancer.clear_plan();
            continue;
        }
        if node.rebalancer.needs_plan() {
            let plan = plan(&node);
            if !plan.is_empty() {
                info!(moves = plan.len(), "rebalance planned");
            }
            node.rebalancer.load(plan);
        }
        let Some(planned) = node.rebalancer.begin_next() else {
            continue;
        };

        let PlannedMove { region, step } = &planned;
        debug!(
            region,
            bucket = step.bucket,
            from = %step.from,
            to = %step.to,
            kind = ?step.kind,
            "rebalance move starting"
        );
        match execute(&node, region, step).await {
            Ok(true) => {
                info!(region, bucket = step.bucket, from = %step.from, to = %step.to, kind = ?step.kind, "bucket moved");
                counter!("lode_rebalance_moves_total").increment(1);
                node.rebalancer.finish(true);
            }
            Ok(false) => {
                debug!(region, bucket = step.bucket, "move no longer applies, replanning");
                node.rebalancer.clear_plan();
                node.rebalancer.skip();
            }
            Err(e) => {
                warn!(region, bucket = step.bucket, to = %step.to, "rebalance move failed: {e}");
                counter!("lode_rebalance_failures_total").increment(1);
                node.rebalancer.clear_plan();
                node.rebalancer.finish(false);
            }
        }
    }
}

/// Moves for every active region with full redundancy. Regions still
/// being repaired are left alone until the repair is done.
fn plan(node: &NodeInner) -> Vec<PlannedMove> {
    let view = node.view();
    let snapshot = node.directory.current();
    let mut entries: Vec<_> = snapshot
        .regions()
        .filter(|e| e.is_active())
        .filter(|e| e.table.under_redundant_buckets(view.len()).is_empty())
        .collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));

    let mut budget = node.config.rebalance.max_moves_per_pass;
    let mut plan = Vec::new();
    for entry in entries {
        if budget == 0 {
            break;
        }
        let moves = allocator::plan_rebalance(&entry.table, &view, budget);
        budget -= moves.len();
        plan.extend(moves.into_iter().map(|step| PlannedMove {
            region: entry.name().to_string(),
            step,
        }));
    }
    plan
}

/// Runs one move. Returns `Ok(false)` if it no longer applies.
///
/// Every publication names the epoch of the slot it was derived from, so
/// a repair landing while the move waits on seeding or the hand-off wins
/// and the move is abandoned.
async fn execute(node: &Arc<NodeInner>, region: &str, step: &BucketMove) -> Result<bool, GridError> {
    let Some(entry) = node.directory.entry(region).filter(|e| e.is_active()) else {
        return Ok(false);
    };
    let Some(mut current) = entry.table.bucket(step.bucket).cloned() else {
        return Ok(false);
    };
    if !applies(node, &current, step) {
        return Ok(false);
    }

    if !current.is_owner(step.to) {
        let key = HandoffKey {
            region: entry.id.clone(),
            bucket: step.bucket,
            target: step.to,
        };
        let (tx, rx) = oneshot::channel();
        node.seed_waiters.insert(key.clone(), tx);
        let widened = allocator::add_copy(&current, step.to);
        if let Err(e) = node
            .publish_bucket(region, step.bucket, current.epoch, widened)
            .await
        {
            node.seed_waiters.remove(&key);
            return if is_stale(&e) { Ok(false) } else { Err(e) };
        }
        let seeded = tokio::time::timeout(node.config.rebalance.handoff_timeout(), rx).await;
        node.seed_waiters.remove(&key);
        if !matches!(seeded, Ok(Ok(_))) {
            narrow(node, region, step).await?;
            return Err(GridError::Timeout);
        }
        // the table may have moved on while the copy was seeded
        current = match node
            .directory
            .entry(region)
            .filter(|e| e.id == entry.id && e.is_active())
            .and_then(|e| e.table.bucket(step.bucket).cloned())
        {
            Some(c) if applies(node, &c, step) && c.is_owner(step.to) => c,
            _ => return Ok(false),
        };
    }

    if step.kind == MoveKind::Primary {
        let ready = if step.from == node.id {
            handoff::finalize(node, &entry.id, step.bucket, current.epoch, step.to).await
        } else {
            finalize_remote(node, &entry.id, step, current.epoch).await
        };
        if let Err(e) = ready {
            // republishing under a newer epoch lifts the old primary's
            // freeze, if it got that far; a repair that got there first
            // already did
            let mut unchanged = current.clone();
            unchanged.epoch += 1;
            match node
                .publish_bucket(region, step.bucket, current.epoch, unchanged)
                .await
            {
                Err(stale) if !is_stale(&stale) => return Err(stale),
                _ => return Err(e),
            }
        }
    }

    match node
        .publish_bucket(
            region,
            step.bucket,
            current.epoch,
            allocator::complete_move(&current, step),
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if is_stale(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// True if `step` can still run against `current` with both members in
/// the view.
fn applies(node: &NodeInner, current: &lode_cluster::BucketOwnership, step: &BucketMove) -> bool {
    let view = node.view();
    still_applies(current, step) && view.contains(step.to) && view.contains(step.from)
}

/// The slot moved on (or the region stopped being active) while the move
/// was waiting.
fn is_stale(e: &GridError) -> bool {
    matches!(
        e,
        GridError::StaleEpoch { .. } | GridError::RegionNotActive { .. } | GridError::RegionNotFound(_)
    )
}

fn still_applies(current: &lode_cluster::BucketOwnership, step: &BucketMove) -> bool {
    match step.kind {
        MoveKind::Primary => current.primary == Some(step.from),
        MoveKind::Secondary => current.secondaries.contains(&step.from),
    }
}

async fn finalize_remote(
    node: &NodeInner,
    region: &lode_cluster::RegionId,
    step: &BucketMove,
    epoch: u64,
) -> Result<lode_cluster::VersionStamp, GridError> {
    let addr = node
        .view()
        .addr_of(step.from)
        .ok_or_else(|| GridError::Unavailable(format!("{} left the view", step.from)))?;
    let request = Request::HandoffFinalize {
        region: region.clone(),
        bucket: step.bucket,
        epoch,
        target: step.to,
    };
    let timeout = node.config.rebalance.chunk_timeout() + node.config.router.request_timeout();
    match node.call_with(addr, request, timeout).await? {
        Response::HandoffReady(result) => result,
        other => Err(unexpected(&other)),
    }
}

/// Takes back the extra copy a failed move added.
async fn narrow(node: &Arc<NodeInner>, region: &str, step: &BucketMove) -> Result<(), GridError> {
    let Some(current) = node
        .directory
        .entry(region)
        .and_then(|e| e.table.bucket(step.bucket).cloned())
    else {
        return Ok(());
    };
    if !current.secondaries.contains(&step.to) {
        return Ok(());
    }
    let mut narrowed = current.clone();
    narrowed.secondaries.retain(|s| *s != step.to);
    narrowed.epoch += 1;
    match node
        .publish_bucket(region, step.bucket, current.epoch, narrowed)
        .await
    {
        Ok(_) => {
            warn!(region, bucket = step.bucket, target = %step.to, "seeding timed out, copy withdrawn");
            Ok(())
        }
        // whatever replaced the slot decided about the copy
        Err(e) if is_stale(&e) => Ok(()),
        Err(e) => Err(e),
    }
}
