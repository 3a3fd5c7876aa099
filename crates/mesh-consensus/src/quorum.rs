//! Yes/no tally over a fixed electorate.

use std::collections::BTreeSet;

use mesh_protocol::NodeId;

/// Strict majority of an electorate of `n` nodes.
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyState {
    /// Still possible either way.
    Undecided,
    /// Yes votes reached quorum.
    Reached,
    /// Even if every outstanding voter says yes, quorum cannot be reached.
    Unreachable,
}

/// Votes cast so far. Each voter counts once; the first vote wins.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    yes: BTreeSet<NodeId>,
    no: BTreeSet<NodeId>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. Returns false if `voter` had already voted.
    pub fn record(&mut self, voter: &NodeId, approve: bool) -> bool {
        if self.has_voted(voter) {
            return false;
        }
        if approve {
            self.yes.insert(voter.clone());
        } else {
            self.no.insert(voter.clone());
        }
        true
    }

    pub fn has_voted(&self, voter: &NodeId) -> bool {
        self.yes.contains(voter) || self.no.contains(voter)
    }

    pub fn yes(&self) -> usize {
        self.yes.len()
    }

    pub fn no(&self) -> usize {
        self.no.len()
    }

    pub fn yes_voters(&self) -> impl Iterator<Item = &NodeId> {
        self.yes.iter()
    }

    pub fn evaluate(&self, electorate: usize, quorum: usize) -> TallyState {
        if self.yes() >= quorum {
            return TallyState::Reached;
        }
        let outstanding = electorate.saturating_sub(self.yes() + self.no());
        if self.yes() + outstanding < quorum {
            TallyState::Unreachable
        } else {
            TallyState::Undecided
        }
    }
}
