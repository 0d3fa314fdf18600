//! Membership views.
//!
//! A `View` is immutable once published. The next view is built from the
//! previous one and replaces it atomically; readers holding an
//! `Arc<View>` are never affected by a newer publication.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::member::{Member, MemberId, MemberStatus};

/// An agreed, versioned membership snapshot.
///
/// Members are kept in admission order (ascending incarnation), so the
/// first member is always the oldest and acts as coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub generation: u64,
    members: Vec<Member>,
}

impl View {
    /// An empty view at generation 0, held by members that have not been
    /// admitted yet.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            members: Vec::new(),
        }
    }

    /// The first view of a new cluster, containing only its founder.
    pub fn founding(mut founder: Member) -> Self {
        founder.incarnation = 1;
        founder.status = MemberStatus::Alive;
        Self {
            generation: 1,
            members: vec![founder],
        }
    }

    /// Builds a view from an arbitrary member list, sorting by seniority.
    pub fn from_members(generation: u64, mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| m.seniority());
        Self {
            generation,
            members,
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The oldest member, which serializes view changes.
    pub fn coordinator(&self) -> Option<&Member> {
        self.members.first()
    }

    pub fn is_coordinator(&self, id: MemberId) -> bool {
        self.coordinator().is_some_and(|m| m.id == id)
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.member(id).is_some()
    }

    pub fn addr_of(&self, id: MemberId) -> Option<SocketAddr> {
        self.member(id).map(|m| m.addr)
    }

    pub fn ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    /// Votes needed for a strict majority of this view.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Returns the next view with `member` admitted.
    ///
    /// The new member's incarnation is the new generation, so incarnations
    /// are unique and grow with every admission.
    pub fn admit(&self, mut member: Member) -> View {
        let generation = self.generation + 1;
        member.incarnation = generation;
        member.status = MemberStatus::Alive;
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|m| m.id != member.id)
            .cloned()
            .collect();
        members.push(member);
        View::from_members(generation, members)
    }

    /// Returns the next view with the given members removed.
    pub fn remove(&self, departed: &[MemberId]) -> View {
        let members = self
            .members
            .iter()
            .filter(|m| !departed.contains(&m.id))
            .cloned()
            .collect();
        View::from_members(self.generation + 1, members)
    }
}

/// A transition between two consecutive published views.
#[derive(Debug, Clone)]
pub struct ViewChange {
    pub old: Arc<View>,
    pub new: Arc<View>,
}

impl ViewChange {
    pub fn new(old: Arc<View>, new: Arc<View>) -> Self {
        Self { old, new }
    }

    /// Members present in the new view but not the old one.
    pub fn joined(&self) -> Vec<&Member> {
        self.new
            .members()
            .iter()
            .filter(|m| !self.old.contains(m.id))
            .collect()
    }

    /// Members present in the old view but gone from the new one.
    pub fn departed(&self) -> Vec<&Member> {
        self.old
            .members()
            .iter()
            .filter(|m| !self.new.contains(m.id))
            .collect()
    }

    /// True if the coordinator changed across the transition.
    pub fn coordinator_changed(&self) -> bool {
        self.old.coordinator().map(|m| m.id) != self.new.coordinator().map(|m| m.id)
    }
}
