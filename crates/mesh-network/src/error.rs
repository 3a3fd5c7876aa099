use mesh_protocol::{ConnectionState, NodeId, ProtocolError};
use thiserror::Error;

/// Failures of a single transport channel or of the signaling step.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel to {0} is closed")]
    ChannelClosed(NodeId),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Peer {peer} is unreachable: {reason}")]
    Unreachable { peer: NodeId, reason: String },

    #[error("Transport is not bound")]
    NotBound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors surfaced by the registry and the router.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(NodeId),

    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),

    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("Refusing to connect to self")]
    SelfConnection,

    #[error("Invalid transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: NodeId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(NodeId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
