//! Mesh Consensus - quorum agreement on coordination decisions
//!
//! Decisions that must not be taken unilaterally (granting an agent spawn
//! on a specific node, moving an agent, declaring a peer faulty) are raised
//! as proposals and settled by a single round of yes/no votes:
//!
//! - The electorate is the proposer plus every peer `Connected` when the
//!   proposal is created, frozen for the lifetime of the proposal
//! - Quorum is a strict majority of that electorate
//! - Epochs increase monotonically per proposer; stale epochs are rejected
//! - Outcomes are write-once: `Pending -> Committed | Rejected`

pub mod engine;
pub mod quorum;

pub use engine::{ConsensusConfig, ConsensusEngine, Decision, ProposalRecord, ProposalRole};
pub use quorum::{quorum_size, Tally, TallyState};

use mesh_protocol::{NodeId, ProposalId, ProposalOutcome};

/// Errors that can occur during a consensus round.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    #[error("Stale epoch from {proposer}: got {got}, last seen {last_seen}")]
    StaleEpoch {
        proposer: NodeId,
        got: u64,
        last_seen: u64,
    },

    #[error("{voter} is not in the electorate of proposal {proposal_id}")]
    NotInElectorate {
        voter: NodeId,
        proposal_id: ProposalId,
    },

    #[error("Proposal {proposal_id} is already {outcome}")]
    AlreadyDecided {
        proposal_id: ProposalId,
        outcome: ProposalOutcome,
    },

    #[error("Conflicting outcome for {proposal_id}: recorded {recorded}, received {received}")]
    OutcomeConflict {
        proposal_id: ProposalId,
        recorded: ProposalOutcome,
        received: ProposalOutcome,
    },

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),
}
