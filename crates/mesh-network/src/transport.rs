//! Transport abstraction.
//!
//! A transport performs the signaling exchange (offer/answer/candidate)
//! with a remote node and then hands back a duplex, ordered channel.
//! Everything above this module works against [`Transport`] and
//! [`TransportChannel`] only and cannot tell loopback from TCP.
//!
//! Inbound traffic for all channels of a node is funneled into a single
//! [`TransportEvent`] stream, which the node's event loop consumes.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use mesh_protocol::{Handshake, NodeId};
use tokio::sync::mpsc;

use crate::TransportError;

/// Produces a fresh local handshake (new nonce, new timestamp) for every
/// signaling exchange.
pub type HandshakeSource = Arc<dyn Fn() -> Handshake + Send + Sync>;

/// Sink for inbound transport events of one node.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// One end of a duplex channel to a directly connected peer.
///
/// Frames sent on one channel arrive in send order. `send` never blocks:
/// it either queues the frame or fails because the channel is closed.
pub trait TransportChannel: Send + Sync {
    /// The remote node this channel leads to.
    fn peer_id(&self) -> &NodeId;

    /// Identifier distinguishing this channel from earlier channels to the
    /// same peer.
    fn conn_id(&self) -> u64;

    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the channel. The remote side observes a `Closed` event.
    fn close(&self);

    fn is_open(&self) -> bool;
}

impl fmt::Debug for dyn TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("peer_id", self.peer_id())
            .field("conn_id", &self.conn_id())
            .field("open", &self.is_open())
            .finish()
    }
}

/// A channel together with the handshake the remote presented.
pub struct Connection {
    pub remote: Handshake,
    pub channel: Box<dyn TransportChannel>,
    /// Address the remote announced for dialing it back. Only trusted once
    /// the node has accepted the handshake.
    pub candidate: Option<String>,
}

impl Connection {
    pub fn new(remote: Handshake, channel: Box<dyn TransportChannel>) -> Self {
        Self {
            remote,
            channel,
            candidate: None,
        }
    }

    pub fn with_candidate(mut self, addr: impl Into<String>) -> Self {
        self.candidate = Some(addr.into());
        self
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote.node_id)
            .field("channel", &self.channel)
            .field("candidate", &self.candidate)
            .finish()
    }
}

/// Events delivered from the transport to the owning node.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote node completed signaling with us.
    Incoming(Connection),
    /// A frame arrived on channel `conn_id` from `peer`.
    Frame {
        peer: NodeId,
        conn_id: u64,
        data: Bytes,
    },
    /// Channel `conn_id` to `peer` was closed by the remote or failed.
    Closed {
        peer: NodeId,
        conn_id: u64,
        reason: String,
    },
}

/// Signaling plus channel establishment.
pub trait Transport: Send + Sync {
    /// Start accepting connections. Inbound events go to `events`.
    fn bind<'a>(
        &'a self,
        handshake: HandshakeSource,
        events: EventSink,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Run the signaling exchange with `peer` and open a channel.
    fn connect<'a>(&'a self, peer: &'a NodeId) -> BoxFuture<'a, Result<Connection, TransportError>>;

    /// Stop accepting connections. Open channels are closed by their owners.
    fn unbind(&self);

    /// Node ids this transport knows how to reach without being told.
    fn known_peers(&self) -> Vec<NodeId> {
        Vec::new()
    }

    /// Record where an accepted peer can be dialed back.
    fn learn_address(&self, _peer: &NodeId, _addr: &str) {}
}
