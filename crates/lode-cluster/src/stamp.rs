//! Entry version stamps.

use serde::{Deserialize, Serialize};

/// Orders updates to a single key.
///
/// Compared lexicographically by `(epoch, sequence, incarnation)`. The
/// bucket's ownership epoch comes first so that any write accepted by a
/// promoted primary dominates everything its predecessor issued. Within
/// one epoch there is a single primary, so the per-bucket sequence alone
/// totally orders its writes; the incarnation is a final tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct VersionStamp {
    pub epoch: u64,
    pub sequence: u64,
    pub incarnation: u64,
}

impl VersionStamp {
    pub fn new(epoch: u64, sequence: u64, incarnation: u64) -> Self {
        Self {
            epoch,
            sequence,
            incarnation,
        }
    }
}

impl std::fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}@{}", self.epoch, self.sequence, self.incarnation)
    }
}
