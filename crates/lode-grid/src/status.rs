//! Region status reports.

use lode_cluster::{
    BucketHealth, MemberId, MemberIndex, RegionEntry, RegionId, RegionState, View,
};
use serde::Serialize;

/// How many buckets one member hosts for a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberLoad {
    pub member: MemberId,
    pub primaries: usize,
    pub secondaries: usize,
}

/// Lifecycle, load and redundancy of one region as seen by this member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStatus {
    pub id: RegionId,
    pub state: RegionState,
    pub bucket_count: u32,
    pub redundancy: u32,
    pub table_version: u64,
    /// Every view member, including those hosting nothing.
    pub members: Vec<MemberLoad>,
    /// Buckets with a primary but fewer secondaries than the target.
    pub under_redundant: Vec<u32>,
    /// Buckets with no surviving copy.
    pub lost_buckets: Vec<u32>,
}

impl RegionStatus {
    pub fn build(entry: &RegionEntry, view: &View) -> Self {
        let index = MemberIndex::build(&entry.table);
        let members = view
            .ids()
            .map(|id| {
                let primaries = index.primary_load(id);
                MemberLoad {
                    member: id,
                    primaries,
                    secondaries: index.load(id) - primaries,
                }
            })
            .collect();
        let under_redundant = (0..entry.table.bucket_count())
            .filter(|&b| {
                matches!(
                    entry.table.health(b, view.len()),
                    BucketHealth::UnderRedundant { .. }
                )
            })
            .collect();
        Self {
            id: entry.id.clone(),
            state: entry.state,
            bucket_count: entry.config.bucket_count,
            redundancy: entry.config.redundancy,
            table_version: entry.table.version,
            members,
            under_redundant,
            lost_buckets: entry.table.lost_buckets(),
        }
    }

    /// Active, with every bucket at full redundancy.
    pub fn is_healthy(&self) -> bool {
        self.state == RegionState::Active
            && self.under_redundant.is_empty()
            && self.lost_buckets.is_empty()
    }

    pub fn load_of(&self, member: MemberId) -> Option<&MemberLoad> {
        self.members.iter().find(|m| m.member == member)
    }
}
