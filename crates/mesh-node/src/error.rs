use mesh_consensus::ConsensusError;
use mesh_network::{NetworkError, TransportError};
use mesh_protocol::{NodeId, ProtocolError};
use mesh_state::{CollaboratorError, CoordinationError};

/// Errors surfaced by the [`NetworkManager`](crate::NetworkManager) facade.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node is not initialized or has shut down")]
    NotReady,

    #[error("Node is already initialized")]
    AlreadyInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    #[error("Handshake from {peer} rejected: {reason}")]
    HandshakeRejected { peer: NodeId, reason: String },

    #[error("Proposal refused locally: {0}")]
    ProposalRefused(String),

    #[error("Proposal was dropped before reaching a decision")]
    ProposalDropped,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}
