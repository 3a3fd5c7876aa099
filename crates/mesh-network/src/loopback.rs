//! In-process loopback transport.
//!
//! A [`LoopbackHub`] plays the role of the signaling endpoint for every node
//! in one process. Channels are pairs of unbounded queues, so per-channel
//! FIFO holds and delivery is deterministic enough for multi-node tests.
//!
//! `mute` makes a node go silent: everything it sends is dropped, which is
//! how tests simulate a peer that stops answering heartbeats. `sever` makes
//! every send toward a node fail without either side being told.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use mesh_protocol::NodeId;

use crate::transport::{
    Connection, EventSink, HandshakeSource, Transport, TransportChannel, TransportEvent,
};
use crate::TransportError;

struct Endpoint {
    handshake: HandshakeSource,
    events: EventSink,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<NodeId, Endpoint>,
    muted: HashMap<NodeId, Arc<AtomicBool>>,
    severed: HashMap<NodeId, Arc<AtomicBool>>,
}

impl HubState {
    fn mute_flag(&mut self, node: &NodeId) -> Arc<AtomicBool> {
        self.muted
            .entry(node.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn severed_flag(&mut self, node: &NodeId) -> Arc<AtomicBool> {
        self.severed
            .entry(node.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

/// Shared in-process signaling endpoint.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    next_conn: Arc<AtomicU64>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for `node_id` attached to this hub.
    pub fn transport(&self, node_id: impl Into<NodeId>) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            node_id: node_id.into(),
        }
    }

    /// Drop every frame `node` sends from now on.
    pub fn mute(&self, node: &NodeId) {
        self.lock().mute_flag(node).store(true, Ordering::SeqCst);
    }

    pub fn unmute(&self, node: &NodeId) {
        self.lock().mute_flag(node).store(false, Ordering::SeqCst);
    }

    /// Fail every send toward `node` from now on. Nobody is notified; the
    /// senders find out from the error.
    pub fn sever(&self, node: &NodeId) {
        self.lock().severed_flag(node).store(true, Ordering::SeqCst);
    }

    pub fn is_bound(&self, node: &NodeId) -> bool {
        self.lock().endpoints.contains_key(node)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loopback transport of a single node.
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    node_id: NodeId,
}

impl LoopbackTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Transport for LoopbackTransport {
    fn bind<'a>(
        &'a self,
        handshake: HandshakeSource,
        events: EventSink,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.hub.lock();
            if state.endpoints.contains_key(&self.node_id) {
                return Err(TransportError::Handshake(format!(
                    "{} is already bound to the hub",
                    self.node_id
                )));
            }
            state
                .endpoints
                .insert(self.node_id.clone(), Endpoint { handshake, events });
            tracing::debug!(node = %self.node_id, "Bound to loopback hub");
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: &'a NodeId) -> BoxFuture<'a, Result<Connection, TransportError>> {
        Box::pin(async move {
            if peer == &self.node_id {
                return Err(TransportError::Handshake("cannot connect to self".into()));
            }

            let mut state = self.hub.lock();
            let local_muted = state.mute_flag(&self.node_id);
            let remote_muted = state.mute_flag(peer);
            let local_severed = state.severed_flag(&self.node_id);
            let remote_severed = state.severed_flag(peer);

            let local = state
                .endpoints
                .get(&self.node_id)
                .ok_or(TransportError::NotBound)?;
            let remote = state
                .endpoints
                .get(peer)
                .ok_or_else(|| TransportError::Unreachable {
                    peer: peer.clone(),
                    reason: "not bound to the hub".into(),
                })?;
            if remote_muted.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable {
                    peer: peer.clone(),
                    reason: "no answer to offer".into(),
                });
            }

            // Offer / answer.
            let offer = (local.handshake)();
            let answer = (remote.handshake)();
            if &answer.node_id != peer {
                return Err(TransportError::Handshake(format!(
                    "expected answer from {peer}, got {}",
                    answer.node_id
                )));
            }

            let conn_id = self.hub.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
            let open = Arc::new(AtomicBool::new(true));
            let ours = LoopbackChannel {
                local: self.node_id.clone(),
                peer: peer.clone(),
                conn_id,
                open: open.clone(),
                remote_events: remote.events.clone(),
                muted: local_muted,
                peer_severed: remote_severed,
            };
            let theirs = LoopbackChannel {
                local: peer.clone(),
                peer: self.node_id.clone(),
                conn_id,
                open,
                remote_events: local.events.clone(),
                muted: remote_muted,
                peer_severed: local_severed,
            };

            remote
                .events
                .send(TransportEvent::Incoming(Connection::new(offer, Box::new(theirs))))
                .map_err(|_| TransportError::Unreachable {
                    peer: peer.clone(),
                    reason: "event loop stopped".into(),
                })?;
            drop(state);

            tracing::debug!(node = %self.node_id, peer = %peer, conn_id, "Loopback channel open");
            Ok(Connection::new(answer, Box::new(ours)))
        })
    }

    fn unbind(&self) {
        self.hub.lock().endpoints.remove(&self.node_id);
    }

    fn known_peers(&self) -> Vec<NodeId> {
        let state = self.hub.lock();
        let mut peers: Vec<NodeId> = state
            .endpoints
            .keys()
            .filter(|id| *id != &self.node_id)
            .cloned()
            .collect();
        peers.sort();
        peers
    }
}

struct LoopbackChannel {
    local: NodeId,
    peer: NodeId,
    conn_id: u64,
    /// Shared by both halves of the pair.
    open: Arc<AtomicBool>,
    /// Event sink of the remote node.
    remote_events: EventSink,
    /// Mute flag of the sending node.
    muted: Arc<AtomicBool>,
    /// Sever flag of the receiving node.
    peer_severed: Arc<AtomicBool>,
}

impl TransportChannel for LoopbackChannel {
    fn peer_id(&self) -> &NodeId {
        &self.peer
    }

    fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(self.peer.clone()));
        }
        if self.peer_severed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(self.peer.clone()));
        }
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remote_events
            .send(TransportEvent::Frame {
                peer: self.local.clone(),
                conn_id: self.conn_id,
                data: frame,
            })
            .map_err(|_| {
                self.open.store(false, Ordering::SeqCst);
                TransportError::ChannelClosed(self.peer.clone())
            })
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.remote_events.send(TransportEvent::Closed {
                peer: self.local.clone(),
                conn_id: self.conn_id,
                reason: "closed by peer".into(),
            });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_protocol::Handshake;
    use tokio::sync::mpsc;

    fn source(id: &'static str) -> HandshakeSource {
        Arc::new(move || Handshake::new(NodeId::new(id), None))
    }

    #[tokio::test]
    async fn test_connect_delivers_incoming_and_frames_in_order() {
        let hub = LoopbackHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.bind(source("node-a"), a_tx).await.unwrap();
        b.bind(source("node-b"), b_tx).await.unwrap();

        let conn = a.connect(&NodeId::new("node-b")).await.unwrap();
        assert_eq!(conn.remote.node_id, NodeId::new("node-b"));

        match b_rx.recv().await.unwrap() {
            TransportEvent::Incoming(c) => assert_eq!(c.remote.node_id, NodeId::new("node-a")),
            other => panic!("unexpected event: {other:?}"),
        }

        for i in 0..3u8 {
            conn.channel.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..3u8 {
            match b_rx.recv().await.unwrap() {
                TransportEvent::Frame { peer, data, .. } => {
                    assert_eq!(peer, NodeId::new("node-a"));
                    assert_eq!(data.as_ref(), &[i]);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_notifies_remote_and_fails_sends() {
        let hub = LoopbackHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.bind(source("node-a"), a_tx).await.unwrap();
        b.bind(source("node-b"), b_tx).await.unwrap();

        let conn = a.connect(&NodeId::new("node-b")).await.unwrap();
        let _incoming = b_rx.recv().await.unwrap();
        conn.channel.close();
        assert!(!conn.channel.is_open());
        assert!(conn.channel.send(Bytes::from_static(b"x")).is_err());
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let hub = LoopbackHub::new();
        let a = hub.transport("node-a");
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        a.bind(source("node-a"), a_tx).await.unwrap();
        assert!(matches!(
            a.connect(&NodeId::new("node-z")).await,
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_muted_sender_is_silent() {
        let hub = LoopbackHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.bind(source("node-a"), a_tx).await.unwrap();
        b.bind(source("node-b"), b_tx).await.unwrap();

        let conn = a.connect(&NodeId::new("node-b")).await.unwrap();
        let _incoming = b_rx.recv().await.unwrap();
        hub.mute(&NodeId::new("node-a"));
        conn.channel.send(Bytes::from_static(b"lost")).unwrap();
        assert!(b_rx.try_recv().is_err());
    }
}
