//! Bucket ownership tables.
//!
//! A table records, for every bucket of one region, the primary, the
//! secondaries and the ownership epoch. Tables only hold forward
//! references (bucket → member ids). The reverse mapping is a
//! [`MemberIndex`] rebuilt from a table on demand.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::member::MemberId;
use crate::region::RegionId;

/// Secondary owners of one bucket. Redundancy is small in practice, so
/// the list lives inline.
pub type Secondaries = SmallVec<[MemberId; 4]>;

/// Owners of a single bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOwnership {
    /// `None` when every copy of the bucket has been lost.
    pub primary: Option<MemberId>,
    pub secondaries: Secondaries,
    /// Incremented on every reassignment of this bucket.
    pub epoch: u64,
}

impl BucketOwnership {
    pub fn new(primary: MemberId, secondaries: Secondaries) -> Self {
        Self {
            primary: Some(primary),
            secondaries,
            epoch: 1,
        }
    }

    /// All owners, primary first.
    pub fn owners(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.primary.into_iter().chain(self.secondaries.iter().copied())
    }

    pub fn is_owner(&self, id: MemberId) -> bool {
        self.primary == Some(id) || self.secondaries.contains(&id)
    }

    pub fn copies(&self) -> usize {
        usize::from(self.primary.is_some()) + self.secondaries.len()
    }

    pub fn is_lost(&self) -> bool {
        self.primary.is_none()
    }
}

/// A member's role for one bucket, derived from a table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerRole {
    PrimaryFor { bucket: u32, epoch: u64 },
    SecondaryFor { bucket: u32, epoch: u64 },
    NotOwner,
}

impl OwnerRole {
    pub fn epoch(&self) -> Option<u64> {
        match *self {
            OwnerRole::PrimaryFor { epoch, .. } | OwnerRole::SecondaryFor { epoch, .. } => {
                Some(epoch)
            }
            OwnerRole::NotOwner => None,
        }
    }

    pub fn is_owner(&self) -> bool {
        !matches!(self, OwnerRole::NotOwner)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, OwnerRole::PrimaryFor { .. })
    }
}

impl std::fmt::Display for OwnerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerRole::PrimaryFor { bucket, epoch } => write!(f, "primary({bucket}@{epoch})"),
            OwnerRole::SecondaryFor { bucket, epoch } => write!(f, "secondary({bucket}@{epoch})"),
            OwnerRole::NotOwner => write!(f, "not-owner"),
        }
    }
}

/// Redundancy state of a bucket relative to the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketHealth {
    Healthy,
    /// Primary present but fewer secondaries than the target.
    UnderRedundant { missing: u32 },
    /// No surviving copy.
    Lost,
}

/// Ownership of every bucket in one region.
///
/// Never mutated once published: the allocator builds a successor with a
/// higher `version` and the directory swaps it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTable {
    pub region: RegionId,
    /// Generation of the view this table was computed under.
    pub view_generation: u64,
    /// Publication counter for this region; members only install a table
    /// whose version is newer than the one they hold.
    pub version: u64,
    pub redundancy: u32,
    buckets: Vec<BucketOwnership>,
}

impl OwnershipTable {
    pub fn new(
        region: RegionId,
        view_generation: u64,
        redundancy: u32,
        buckets: Vec<BucketOwnership>,
    ) -> Self {
        Self {
            region,
            view_generation,
            version: 1,
            redundancy,
            buckets,
        }
    }

    /// Builds the successor of this table with new bucket assignments.
    pub fn successor(&self, view_generation: u64, buckets: Vec<BucketOwnership>) -> Self {
        Self {
            region: self.region.clone(),
            view_generation,
            version: self.version + 1,
            redundancy: self.redundancy,
            buckets,
        }
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn bucket(&self, bucket: u32) -> Option<&BucketOwnership> {
        self.buckets.get(bucket as usize)
    }

    pub fn buckets(&self) -> &[BucketOwnership] {
        &self.buckets
    }

    pub fn primary_of(&self, bucket: u32) -> Option<MemberId> {
        self.bucket(bucket).and_then(|b| b.primary)
    }

    pub fn epoch_of(&self, bucket: u32) -> Option<u64> {
        self.bucket(bucket).map(|b| b.epoch)
    }

    /// The role `member` plays for `bucket` in this table.
    pub fn role_of(&self, member: MemberId, bucket: u32) -> OwnerRole {
        match self.bucket(bucket) {
            Some(b) if b.primary == Some(member) => OwnerRole::PrimaryFor {
                bucket,
                epoch: b.epoch,
            },
            Some(b) if b.secondaries.contains(&member) => OwnerRole::SecondaryFor {
                bucket,
                epoch: b.epoch,
            },
            _ => OwnerRole::NotOwner,
        }
    }

    /// Health of `bucket` given how many members could host a copy.
    pub fn health(&self, bucket: u32, eligible_members: usize) -> BucketHealth {
        let Some(b) = self.bucket(bucket) else {
            return BucketHealth::Lost;
        };
        if b.is_lost() {
            return BucketHealth::Lost;
        }
        let target = (self.redundancy as usize).min(eligible_members.saturating_sub(1));
        if b.secondaries.len() < target {
            BucketHealth::UnderRedundant {
                missing: (target - b.secondaries.len()) as u32,
            }
        } else {
            BucketHealth::Healthy
        }
    }

    /// Buckets with no surviving copy.
    pub fn lost_buckets(&self) -> Vec<u32> {
        (0..self.bucket_count())
            .filter(|&b| self.buckets[b as usize].is_lost())
            .collect()
    }

    /// Buckets with a primary but fewer secondaries than the target.
    pub fn under_redundant_buckets(&self, eligible_members: usize) -> Vec<u32> {
        (0..self.bucket_count())
            .filter(|&b| {
                matches!(
                    self.health(b, eligible_members),
                    BucketHealth::UnderRedundant { .. }
                )
            })
            .collect()
    }
}

/// Derived reverse index: which buckets each member hosts.
#[derive(Debug, Default, Clone)]
pub struct MemberIndex {
    hosted: AHashMap<MemberId, Vec<u32>>,
    primaries: AHashMap<MemberId, Vec<u32>>,
}

impl MemberIndex {
    pub fn build(table: &OwnershipTable) -> Self {
        let mut index = MemberIndex::default();
        for (b, ownership) in table.buckets().iter().enumerate() {
            let b = b as u32;
            if let Some(p) = ownership.primary {
                index.primaries.entry(p).or_default().push(b);
            }
            for owner in ownership.owners() {
                index.hosted.entry(owner).or_default().push(b);
            }
        }
        index
    }

    /// Every bucket `member` holds a copy of.
    pub fn hosted_by(&self, member: MemberId) -> &[u32] {
        self.hosted.get(&member).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Buckets `member` is primary for.
    pub fn primaries_of(&self, member: MemberId) -> &[u32] {
        self.primaries.get(&member).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn load(&self, member: MemberId) -> usize {
        self.hosted_by(member).len()
    }

    pub fn primary_load(&self, member: MemberId) -> usize {
        self.primaries_of(member).len()
    }
}
