//! Coordinator succession.
//!
//! When the coordinator departs without handing off, the oldest surviving
//! member (lowest incarnation, then lowest id) becomes the candidate. It
//! asks the other members for votes and publishes the next view once a
//! majority of the electorate agrees. No view change is admitted while an
//! election is pending.

use std::collections::HashSet;
use std::time::Instant;

use crate::MemberId;

/// State for an in-progress coordinator election.
///
/// Created by the candidate when it concludes the coordinator is gone.
/// Discarded once the new view is published or the election times out.
#[derive(Debug)]
pub struct Election {
    /// Generation of the view whose coordinator is being replaced.
    pub generation: u64,
    pub started_at: Instant,
    votes: HashSet<MemberId>,
    won: bool,
}

impl Election {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            started_at: Instant::now(),
            votes: HashSet::new(),
            won: false,
        }
    }

    /// Records a granted vote. Returns `true` if quorum is newly reached.
    ///
    /// `electorate` is the number of members whose votes count. Quorum is
    /// a simple majority: `electorate / 2 + 1`. Once quorum is reached this
    /// returns `true` exactly once, so the caller publishes exactly once.
    pub fn record_vote(&mut self, from: MemberId, electorate: usize) -> bool {
        if self.won {
            return false;
        }
        self.votes.insert(from);
        self.won = self.votes.len() >= Self::quorum(electorate);
        self.won
    }

    pub fn quorum(electorate: usize) -> usize {
        electorate / 2 + 1
    }

    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    pub fn is_won(&self) -> bool {
        self.won
    }
}
