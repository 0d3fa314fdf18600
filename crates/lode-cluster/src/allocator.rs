//! Bucket allocation.
//!
//! Pure functions from (table, views) to a new table. Nothing here talks
//! to the network; the coordinator publishes whatever these produce.
//!
//! Three passes exist:
//!
//! - [`initial_assignment`] spreads a new region over the current view.
//! - [`reassign`] repairs ownership after members depart. It only touches
//!   buckets that lost an owner or are below target redundancy, so data
//!   movement is the minimum needed to restore redundancy.
//! - [`plan_rebalance`] evens out load after growth. It is a separate,
//!   lower-priority pass whose moves are executed one bucket at a time.
//!
//! Candidates are ranked least-loaded first, breaking ties by member id
//! so every member computes the same answer.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::member::{Member, MemberId};
use crate::ownership::{BucketOwnership, OwnershipTable};
use crate::region::{RegionConfig, RegionId};
use crate::view::View;
use crate::GridError;

/// Running per-member counts used to pick the least-loaded candidate.
#[derive(Default)]
struct Loads {
    hosted: AHashMap<MemberId, usize>,
    primaries: AHashMap<MemberId, usize>,
}

impl Loads {
    fn from_table(buckets: &[BucketOwnership], view: &View) -> Self {
        let mut loads = Loads::default();
        for b in buckets {
            if let Some(p) = b.primary.filter(|p| view.contains(*p)) {
                *loads.primaries.entry(p).or_default() += 1;
            }
            for owner in b.owners().filter(|o| view.contains(*o)) {
                *loads.hosted.entry(owner).or_default() += 1;
            }
        }
        loads
    }

    fn hosted(&self, id: MemberId) -> usize {
        self.hosted.get(&id).copied().unwrap_or(0)
    }

    fn primaries(&self, id: MemberId) -> usize {
        self.primaries.get(&id).copied().unwrap_or(0)
    }

    fn add(&mut self, id: MemberId, primary: bool) {
        *self.hosted.entry(id).or_default() += 1;
        if primary {
            *self.primaries.entry(id).or_default() += 1;
        }
    }

    fn remove(&mut self, id: MemberId, primary: bool) {
        if let Some(n) = self.hosted.get_mut(&id) {
            *n = n.saturating_sub(1);
        }
        if primary {
            if let Some(n) = self.primaries.get_mut(&id) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

/// Secondary copies a bucket should have with `live` members available.
fn target_secondaries(redundancy: u32, live: usize) -> usize {
    (redundancy as usize).min(live.saturating_sub(1))
}

/// True if `candidate` shares a redundancy zone with any current owner.
fn zone_conflict(candidate: &Member, owners: &[MemberId], view: &View) -> bool {
    let Some(zone) = candidate.zone.as_deref() else {
        return false;
    };
    owners
        .iter()
        .filter_map(|id| view.member(*id))
        .any(|m| m.zone.as_deref() == Some(zone))
}

/// Picks the surviving secondary to promote: fewest primaries, then lowest
/// member id.
fn pick_heir(secondaries: &[MemberId], loads: &Loads) -> Option<MemberId> {
    secondaries
        .iter()
        .copied()
        .min_by_key(|s| (loads.primaries(*s), *s))
}

/// Picks the best new secondary for a bucket currently owned by `owners`.
///
/// Prefers members outside the owners' zones, then fewer hosted buckets,
/// then lower member id.
fn pick_secondary(owners: &[MemberId], view: &View, loads: &Loads) -> Option<MemberId> {
    view.members()
        .iter()
        .filter(|m| !owners.contains(&m.id))
        .min_by_key(|m| (zone_conflict(m, owners, view), loads.hosted(m.id), m.id))
        .map(|m| m.id)
}

fn pick_primary(view: &View, loads: &Loads) -> Option<MemberId> {
    view.members()
        .iter()
        .min_by_key(|m| (loads.primaries(m.id), loads.hosted(m.id), m.id))
        .map(|m| m.id)
}

/// Assigns every bucket of a new region over the members of `view`.
pub fn initial_assignment(
    region: RegionId,
    config: &RegionConfig,
    view: &View,
) -> Result<OwnershipTable, GridError> {
    config.validate()?;
    if view.is_empty() {
        return Err(GridError::Unavailable(
            "cannot allocate buckets without members".into(),
        ));
    }

    let target = target_secondaries(config.redundancy, view.len());
    let mut loads = Loads::default();
    let mut buckets = Vec::with_capacity(config.bucket_count as usize);

    for _ in 0..config.bucket_count {
        let Some(primary) = pick_primary(view, &loads) else {
            break;
        };
        loads.add(primary, true);
        let mut owners: SmallVec<[MemberId; 4]> = SmallVec::new();
        owners.push(primary);
        let mut secondaries = SmallVec::new();
        while secondaries.len() < target {
            let Some(s) = pick_secondary(&owners, view, &loads) else {
                break;
            };
            loads.add(s, false);
            owners.push(s);
            secondaries.push(s);
        }
        buckets.push(BucketOwnership::new(primary, secondaries));
    }

    Ok(OwnershipTable::new(
        region,
        view.generation,
        config.redundancy,
        buckets,
    ))
}

/// Result of repairing a table after a view change.
#[derive(Debug, Clone)]
pub struct Reassignment {
    pub table: OwnershipTable,
    /// Buckets whose owners (and therefore epoch) changed.
    pub changed: Vec<u32>,
    /// Buckets whose primary was replaced by a surviving secondary.
    pub promoted: Vec<u32>,
    /// Buckets that have no surviving copy.
    pub lost: Vec<u32>,
}

impl Reassignment {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Recomputes ownership for the transition from `old_view` to `new_view`.
///
/// For every bucket that lost its primary, the surviving secondary leading
/// the fewest buckets is promoted, ties going to the lower member id. Missing secondaries are then refilled from live members, least
/// loaded first. Buckets with no surviving copy keep `primary = None` and
/// are reported in `lost`; they are never recreated empty.
pub fn reassign(table: &OwnershipTable, old_view: &View, new_view: &View) -> Reassignment {
    let departed: Vec<MemberId> = old_view
        .ids()
        .filter(|id| !new_view.contains(*id))
        .collect();
    if !departed.is_empty() {
        debug!(
            region = %table.region,
            departed = departed.len(),
            "reassigning buckets after view {} -> {}",
            old_view.generation,
            new_view.generation
        );
    }

    let target = target_secondaries(table.redundancy, new_view.len());
    let mut loads = Loads::from_table(table.buckets(), new_view);
    let mut buckets = Vec::with_capacity(table.buckets().len());
    let mut changed = Vec::new();
    let mut promoted = Vec::new();
    let mut lost = Vec::new();

    for (idx, current) in table.buckets().iter().enumerate() {
        let bucket = idx as u32;
        let mut next = current.clone();
        next.secondaries.retain(|s| new_view.contains(*s));

        match next.primary {
            Some(p) if new_view.contains(p) => {}
            _ => match pick_heir(&next.secondaries, &loads) {
                None => next.primary = None,
                Some(heir) => {
                    next.secondaries.retain(|s| *s != heir);
                    *loads.primaries.entry(heir).or_default() += 1;
                    next.primary = Some(heir);
                    promoted.push(bucket);
                }
            },
        }

        if next.primary.is_none() {
            if current.primary.is_some() {
                warn!(region = %table.region, bucket, "bucket lost: no surviving copy");
            }
            lost.push(bucket);
        } else {
            while next.secondaries.len() < target {
                let owners: SmallVec<[MemberId; 4]> = next.owners().collect();
                let Some(s) = pick_secondary(&owners, new_view, &loads) else {
                    break;
                };
                loads.add(s, false);
                next.secondaries.push(s);
            }
        }

        if next.primary != current.primary || next.secondaries != current.secondaries {
            next.epoch = current.epoch + 1;
            changed.push(bucket);
        }
        buckets.push(next);
    }

    let table = if changed.is_empty() {
        table.clone()
    } else {
        table.successor(new_view.generation, buckets)
    };

    Reassignment {
        table,
        changed,
        promoted,
        lost,
    }
}

/// Which role a rebalance move transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveKind {
    Primary,
    Secondary,
}

/// One step of a growth rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMove {
    pub bucket: u32,
    pub from: MemberId,
    pub to: MemberId,
    pub kind: MoveKind,
    /// The target already holds a secondary copy: a primary move becomes a
    /// role swap and the source stays on as a secondary.
    pub swap: bool,
}

/// Adds `member` as an extra secondary, the first step of a move that
/// needs seeding. Bumps the epoch when anything changed.
pub fn add_copy(current: &BucketOwnership, member: MemberId) -> BucketOwnership {
    let mut next = current.clone();
    if !next.is_owner(member) {
        next.secondaries.push(member);
        next.epoch += 1;
    }
    next
}

/// Ownership once `mv` completes, with the epoch bumped.
///
/// Expects the target to hold a copy already (either a swap, or a copy
/// added by [`add_copy`] and seeded).
pub fn complete_move(current: &BucketOwnership, mv: &BucketMove) -> BucketOwnership {
    let mut next = current.clone();
    match mv.kind {
        MoveKind::Primary => {
            next.secondaries.retain(|s| *s != mv.to);
            next.primary = Some(mv.to);
            if mv.swap {
                next.secondaries.insert(0, mv.from);
            }
        }
        MoveKind::Secondary => {
            next.secondaries.retain(|s| *s != mv.from);
            if !next.secondaries.contains(&mv.to) {
                next.secondaries.push(mv.to);
            }
        }
    }
    next.epoch = current.epoch + 1;
    next
}

fn apply_to_loads(loads: &mut Loads, current: &BucketOwnership, mv: &BucketMove) {
    match (mv.kind, mv.swap) {
        (MoveKind::Primary, true) => {
            *loads.primaries.entry(mv.to).or_default() += 1;
            if let Some(n) = loads.primaries.get_mut(&mv.from) {
                *n = n.saturating_sub(1);
            }
        }
        (MoveKind::Primary, false) => {
            loads.remove(mv.from, true);
            loads.add(mv.to, true);
        }
        (MoveKind::Secondary, _) => {
            loads.remove(mv.from, false);
            if !current.is_owner(mv.to) {
                loads.add(mv.to, false);
            }
        }
    }
}

/// Plans up to `max_moves` moves that even out bucket load across `view`.
///
/// First levels the number of hosted copies (moving secondaries before
/// primaries, since a primary move needs a hand-off lock), then levels
/// primaries, preferring role swaps that move no data. Lost buckets are
/// skipped. The plan is computed against a simulated table so each move
/// sees the effect of the ones before it.
pub fn plan_rebalance(table: &OwnershipTable, view: &View, max_moves: usize) -> Vec<BucketMove> {
    let mut sim: Vec<BucketOwnership> = table.buckets().to_vec();
    let mut loads = Loads::from_table(&sim, view);
    let mut moves = Vec::new();

    while moves.len() < max_moves {
        let Some(mv) = next_copy_move(&sim, view, &loads).or_else(|| next_primary_move(&sim, view, &loads))
        else {
            break;
        };
        let idx = mv.bucket as usize;
        apply_to_loads(&mut loads, &sim[idx], &mv);
        sim[idx] = complete_move(&sim[idx], &mv);
        moves.push(mv);
    }
    moves
}

fn extremes(view: &View, key: impl Fn(MemberId) -> usize) -> Option<(MemberId, MemberId)> {
    let heaviest = view.members().iter().max_by_key(|m| (key(m.id), std::cmp::Reverse(m.id)))?;
    let lightest = view.members().iter().min_by_key(|m| (key(m.id), m.id))?;
    if key(heaviest.id) > key(lightest.id) + 1 {
        Some((heaviest.id, lightest.id))
    } else {
        None
    }
}

fn next_copy_move(sim: &[BucketOwnership], view: &View, loads: &Loads) -> Option<BucketMove> {
    let (heavy, light) = extremes(view, |id| loads.hosted(id))?;
    let candidates = || {
        sim.iter()
            .enumerate()
            .filter(|(_, b)| !b.is_lost() && !b.is_owner(light))
    };
    if let Some((idx, _)) = candidates().find(|(_, b)| b.secondaries.contains(&heavy)) {
        return Some(BucketMove {
            bucket: idx as u32,
            from: heavy,
            to: light,
            kind: MoveKind::Secondary,
            swap: false,
        });
    }
    candidates()
        .find(|(_, b)| b.primary == Some(heavy))
        .map(|(idx, _)| BucketMove {
            bucket: idx as u32,
            from: heavy,
            to: light,
            kind: MoveKind::Primary,
            swap: false,
        })
}

fn next_primary_move(sim: &[BucketOwnership], view: &View, loads: &Loads) -> Option<BucketMove> {
    let (heavy, light) = extremes(view, |id| loads.primaries(id))?;
    sim.iter()
        .enumerate()
        .find(|(_, b)| b.primary == Some(heavy) && b.secondaries.contains(&light))
        .map(|(idx, _)| BucketMove {
            bucket: idx as u32,
            from: heavy,
            to: light,
            kind: MoveKind::Primary,
            swap: true,
        })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use smallvec::smallvec;

    use super::*;
    use crate::member::Member;
    use crate::ownership::MemberIndex;

    fn member(port: u16, zone: Option<&str>) -> Member {
        Member::starting(
            MemberId::new(),
            SocketAddr::from(([127, 0, 0, 1], port)),
            zone.map(str::to_string),
        )
    }

    fn view_of(n: usize) -> View {
        let mut view = View::founding(member(7000, None));
        for i in 1..n {
            view = view.admit(member(7000 + i as u16, None));
        }
        view
    }

    fn region() -> RegionId {
        RegionId::new("orders", 1)
    }

    #[test]
    fn initial_assignment_spreads_primaries() {
        let view = view_of(3);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 6, 1), &view).unwrap();
        let idx = MemberIndex::build(&table);
        for m in view.members() {
            assert_eq!(idx.primary_load(m.id), 2);
            assert_eq!(idx.load(m.id), 4);
        }
        for b in table.buckets() {
            assert_eq!(b.secondaries.len(), 1);
            assert!(!b.secondaries.contains(&b.primary.unwrap()));
            assert_eq!(b.epoch, 1);
        }
    }

    #[test]
    fn initial_assignment_caps_redundancy_at_view_size() {
        let view = view_of(2);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 4, 3), &view).unwrap();
        assert!(table.buckets().iter().all(|b| b.secondaries.len() == 1));
    }

    #[test]
    fn initial_assignment_is_deterministic() {
        let view = view_of(4);
        let cfg = RegionConfig::new("orders", 16, 2);
        let a = initial_assignment(region(), &cfg, &view).unwrap();
        let b = initial_assignment(region(), &cfg, &view).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn initial_assignment_prefers_other_zones() {
        let mut view = View::founding(member(7000, Some("east")));
        view = view.admit(member(7001, Some("east")));
        view = view.admit(member(7002, Some("west")));
        let table = initial_assignment(region(), &RegionConfig::new("orders", 8, 1), &view).unwrap();
        for b in table.buckets() {
            let zone = |id: MemberId| view.member(id).unwrap().zone.clone();
            assert_ne!(zone(b.primary.unwrap()), zone(b.secondaries[0]));
        }
    }

    #[test]
    fn initial_assignment_requires_members() {
        let err = initial_assignment(region(), &RegionConfig::new("orders", 4, 1), &View::empty());
        assert!(matches!(err, Err(GridError::Unavailable(_))));
    }

    #[test]
    fn reassign_promotes_secondary_and_refills() {
        let view = view_of(3);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 4, 1), &view).unwrap();
        let victim = table.primary_of(0).unwrap();
        let heir = table.bucket(0).unwrap().secondaries[0];
        let new_view = view.remove(&[victim]);

        let r = reassign(&table, &view, &new_view);
        assert!(r.promoted.contains(&0));
        assert!(r.lost.is_empty());

        let b0 = r.table.bucket(0).unwrap();
        assert_eq!(b0.primary, Some(heir));
        assert_eq!(b0.secondaries.len(), 1);
        assert!(new_view.contains(b0.secondaries[0]));
        assert_eq!(b0.epoch, 2);
        assert_eq!(r.table.version, table.version + 1);
        assert_eq!(r.table.view_generation, new_view.generation);

        // every bucket the victim did not own keeps its epoch
        for (i, b) in table.buckets().iter().enumerate() {
            if !b.is_owner(victim) {
                assert_eq!(r.table.bucket(i as u32).unwrap(), b);
                assert!(!r.changed.contains(&(i as u32)));
            }
        }
    }

    #[test]
    fn reassign_without_departures_is_a_no_op() {
        let view = view_of(3);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 8, 1), &view).unwrap();
        let grown = view.admit(member(7009, None));
        let r = reassign(&table, &view, &grown);
        assert!(r.is_unchanged());
        assert_eq!(r.table, table);
    }

    #[test]
    fn reassign_marks_lost_buckets() {
        let view = view_of(2);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 2, 0), &view).unwrap();
        let victim = table.primary_of(0).unwrap();
        let r = reassign(&table, &view, &view.remove(&[victim]));
        assert_eq!(r.lost, vec![0]);
        let b0 = r.table.bucket(0).unwrap();
        assert_eq!(b0.primary, None);
        assert!(b0.secondaries.is_empty());
        assert_eq!(b0.epoch, 2);
        // the surviving bucket is untouched
        assert_eq!(r.table.bucket(1), table.bucket(1));
    }

    #[test]
    fn reassign_fills_under_redundant_buckets_after_growth() {
        let view = view_of(1);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 4, 1), &view).unwrap();
        assert!(table.buckets().iter().all(|b| b.secondaries.is_empty()));
        let newcomer = member(7005, None);
        let nid = newcomer.id;
        let grown = view.admit(newcomer);
        let r = reassign(&table, &view, &grown);
        assert_eq!(r.changed.len(), 4);
        assert!(r.table.buckets().iter().all(|b| b.secondaries.as_slice() == [nid]));
    }

    #[test]
    fn complete_primary_move_drops_source_copy() {
        let (a, b, c) = (MemberId::new(), MemberId::new(), MemberId::new());
        let current = BucketOwnership::new(a, smallvec![b]);
        let staged = add_copy(&current, c);
        assert_eq!(staged.epoch, 2);
        let mv = BucketMove {
            bucket: 0,
            from: a,
            to: c,
            kind: MoveKind::Primary,
            swap: false,
        };
        let done = complete_move(&staged, &mv);
        assert_eq!(done.primary, Some(c));
        assert_eq!(done.secondaries.as_slice(), &[b]);
        assert_eq!(done.epoch, 3);
    }

    #[test]
    fn complete_swap_keeps_source() {
        let (a, b) = (MemberId::new(), MemberId::new());
        let current = BucketOwnership::new(a, smallvec![b]);
        let mv = BucketMove {
            bucket: 0,
            from: a,
            to: b,
            kind: MoveKind::Primary,
            swap: true,
        };
        let done = complete_move(&current, &mv);
        assert_eq!(done.primary, Some(b));
        assert_eq!(done.secondaries.as_slice(), &[a]);
        assert_eq!(done.epoch, 2);
    }

    #[test]
    fn rebalance_moves_load_to_newcomer() {
        let view = view_of(2);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 8, 1), &view).unwrap();
        let newcomer = member(7005, None);
        let nid = newcomer.id;
        let grown = view.admit(newcomer);

        let moves = plan_rebalance(&table, &grown, 64);
        assert!(!moves.is_empty());
        assert!(moves.iter().all(|m| m.to == nid || m.swap));

        let mut buckets = table.buckets().to_vec();
        for mv in &moves {
            let b = &mut buckets[mv.bucket as usize];
            *b = complete_move(&add_copy(b, mv.to), mv);
        }
        let balanced = table.successor(grown.generation, buckets);
        let idx = MemberIndex::build(&balanced);
        let loads: Vec<_> = grown.ids().map(|id| idx.load(id)).collect();
        let (min, max) = (*loads.iter().min().unwrap(), *loads.iter().max().unwrap());
        assert!(max - min <= 1, "loads not level: {loads:?}");
        // still exactly one primary and one secondary per bucket
        for b in balanced.buckets() {
            assert!(b.primary.is_some());
            assert_eq!(b.secondaries.len(), 1);
        }
    }

    #[test]
    fn rebalance_respects_move_budget() {
        let view = view_of(1);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 16, 0), &view).unwrap();
        let grown = view.admit(member(7001, None)).admit(member(7002, None));
        assert_eq!(plan_rebalance(&table, &grown, 3).len(), 3);
    }

    #[test]
    fn balanced_table_needs_no_moves() {
        let view = view_of(3);
        let table = initial_assignment(region(), &RegionConfig::new("orders", 9, 1), &view).unwrap();
        assert!(plan_rebalance(&table, &view, 16).is_empty());
    }

    #[test]
    fn heir_is_the_least_loaded_secondary() {
        let view = view_of(4);
        let ids: Vec<MemberId> = view.ids().collect();
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        let table = OwnershipTable::new(
            region(),
            view.generation,
            2,
            vec![
                BucketOwnership::new(a, smallvec![b, c]),
                BucketOwnership::new(b, smallvec![c, d]),
                BucketOwnership::new(b, smallvec![d, c]),
                BucketOwnership::new(d, smallvec![a, b]),
            ],
        );
        let r = reassign(&table, &view, &view.remove(&[a]));
        // b already leads two buckets and d one, so c takes over
        assert_eq!(r.table.primary_of(0), Some(c));
        assert_eq!(r.promoted, vec![0]);
        assert!(r.table.bucket(0).unwrap().secondaries.contains(&b));
    }

    #[test]
    fn heir_ties_break_on_member_id() {
        let view = view_of(3);
        let ids: Vec<MemberId> = view.ids().collect();
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let table = OwnershipTable::new(
            region(),
            view.generation,
            2,
            vec![BucketOwnership::new(a, smallvec![b, c])],
        );
        let r = reassign(&table, &view, &view.remove(&[a]));
        assert_eq!(r.table.primary_of(0), Some(b.min(c)));
    }

    /// Exactly one live primary and `min(R, live - 1)` distinct live
    /// secondaries per bucket.
    fn assert_well_formed(table: &OwnershipTable, view: &View) {
        let target = target_secondaries(table.redundancy, view.len());
        for (idx, b) in table.buckets().iter().enumerate() {
            let primary = b.primary.unwrap_or_else(|| panic!("bucket {idx} lost"));
            assert!(view.contains(primary), "bucket {idx}: primary not in view");
            assert!(!b.secondaries.contains(&primary), "bucket {idx}: primary doubles as secondary");
            assert_eq!(b.secondaries.len(), target, "bucket {idx}: wrong redundancy");
            let distinct: std::collections::HashSet<_> = b.secondaries.iter().collect();
            assert_eq!(distinct.len(), b.secondaries.len(), "bucket {idx}: repeated secondary");
            assert!(b.secondaries.iter().all(|s| view.contains(*s)));
        }
    }

    fn assert_epochs_advance(before: &OwnershipTable, after: &OwnershipTable) {
        for (idx, (old, new)) in before.buckets().iter().zip(after.buckets()).enumerate() {
            if old.primary != new.primary || old.secondaries != new.secondaries {
                assert!(new.epoch > old.epoch, "bucket {idx}: owners changed without a new epoch");
            } else {
                assert!(new.epoch >= old.epoch, "bucket {idx}: epoch went backwards");
            }
        }
        if before.buckets() != after.buckets() {
            assert!(after.version > before.version);
        }
    }

    #[test]
    fn ownership_stays_well_formed_through_churn() {
        let mut view = view_of(3);
        let mut table = initial_assignment(region(), &RegionConfig::new("orders", 16, 2), &view).unwrap();
        assert_well_formed(&table, &view);

        // small LCG so the sequence is fixed but irregular
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next_rand = move || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as usize
        };
        let mut port = 7100;

        for step in 0..120 {
            let roll = next_rand();
            let grow = view.len() <= 2 || (view.len() < 7 && roll % 2 == 0);
            let next_view = if grow {
                port += 1;
                view.admit(member(port, None))
            } else {
                // one departure at a time: with at least two copies of
                // every bucket nothing is ever lost
                let ids: Vec<MemberId> = view.ids().collect();
                view.remove(&[ids[next_rand() % ids.len()]])
            };

            let r = reassign(&table, &view, &next_view);
            assert!(r.lost.is_empty(), "step {step}: lost {:?}", r.lost);
            assert_epochs_advance(&table, &r.table);
            assert_well_formed(&r.table, &next_view);
            table = r.table;
            view = next_view;

            if step % 3 == 0 {
                let moves = plan_rebalance(&table, &view, 256);
                if !moves.is_empty() {
                    let mut buckets = table.buckets().to_vec();
                    for mv in &moves {
                        let idx = mv.bucket as usize;
                        buckets[idx] = complete_move(&buckets[idx], mv);
                    }
                    let balanced = table.successor(view.generation, buckets);
                    assert_epochs_advance(&table, &balanced);
                    assert_well_formed(&balanced, &view);
                    table = balanced;
                }
            }
        }
    }
}
