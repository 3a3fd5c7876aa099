//! TCP transport.
//!
//! Frames are length-delimited JSON (`LengthDelimitedCodec`, u32 big-endian
//! length). A new connection starts with the signaling exchange: the dialer
//! sends an `Offer`, the listener replies with an `Answer` (or `Reject`),
//! and the dialer follows up with a `Candidate` carrying its own listen
//! address so the listener can dial back later. After that the socket
//! carries envelope frames only.
//!
//! Peers are found through a static directory (`node_id -> host:port`)
//! extended with candidates of peers the node accepted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mesh_protocol::{
    Handshake, NodeId, ProtocolError, SignalingMessage, DEFAULT_HANDSHAKE_TIMEOUT_MS, MAX_FRAME_BYTES,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::transport::{
    Connection, EventSink, HandshakeSource, Transport, TransportChannel, TransportEvent,
};
use crate::TransportError;

type Wire = Framed<TcpStream, LengthDelimitedCodec>;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

struct Bound {
    events: EventSink,
    shutdown: watch::Sender<bool>,
}

/// TCP transport of a single node.
pub struct TcpTransport {
    node_id: NodeId,
    listen_addr: String,
    directory: Arc<Mutex<HashMap<NodeId, String>>>,
    handshake_timeout: Duration,
    bound: Mutex<Option<Bound>>,
    handshake: Mutex<Option<HandshakeSource>>,
    next_conn: Arc<AtomicU64>,
}

impl TcpTransport {
    pub fn new(
        node_id: NodeId,
        listen_addr: impl Into<String>,
        directory: HashMap<NodeId, String>,
    ) -> Self {
        Self {
            node_id,
            listen_addr: listen_addr.into(),
            directory: Arc::new(Mutex::new(directory)),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            bound: Mutex::new(None),
            handshake: Mutex::new(None),
            next_conn: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bound on the inbound signaling exchange. Sockets that stay silent
    /// longer are dropped.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Add or replace a directory entry.
    pub fn add_peer_address(&self, peer: NodeId, addr: impl Into<String>) {
        lock(&self.directory).insert(peer, addr.into());
    }

    pub fn peer_address(&self, peer: &NodeId) -> Option<String> {
        lock(&self.directory).get(peer).cloned()
    }

    fn local_handshake(&self) -> Result<Handshake, TransportError> {
        let source = lock(&self.handshake).clone().ok_or(TransportError::NotBound)?;
        Ok(source())
    }

    fn events(&self) -> Result<EventSink, TransportError> {
        lock(&self.bound)
            .as_ref()
            .map(|b| b.events.clone())
            .ok_or(TransportError::NotBound)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for TcpTransport {
    fn bind<'a>(
        &'a self,
        handshake: HandshakeSource,
        events: EventSink,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(self.listen_addr.as_str()).await?;
            tracing::info!(node = %self.node_id, addr = %self.listen_addr, "TCP transport listening");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            *lock(&self.handshake) = Some(handshake.clone());
            *lock(&self.bound) = Some(Bound {
                events: events.clone(),
                shutdown: shutdown_tx,
            });

            tokio::spawn(accept_loop(
                listener,
                handshake,
                events,
                self.next_conn.clone(),
                self.handshake_timeout,
                shutdown_rx,
            ));
            Ok(())
        })
    }

    fn connect<'a>(&'a self, peer: &'a NodeId) -> BoxFuture<'a, Result<Connection, TransportError>> {
        Box::pin(async move {
            let addr = self
                .peer_address(peer)
                .ok_or_else(|| TransportError::Unreachable {
                    peer: peer.clone(),
                    reason: "no address in peer directory".into(),
                })?;
            let events = self.events()?;
            let offer = self.local_handshake()?;

            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| TransportError::Unreachable {
                    peer: peer.clone(),
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true)?;
            let mut wire = Framed::new(stream, frame_codec());

            write_signal(&mut wire, &SignalingMessage::Offer { handshake: offer }).await?;
            let answer = match read_signal(&mut wire).await? {
                SignalingMessage::Answer { handshake } => handshake,
                SignalingMessage::Reject { reason } => {
                    return Err(TransportError::Handshake(format!("rejected by {peer}: {reason}")))
                }
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected answer, got {other:?}"
                    )))
                }
            };
            if &answer.node_id != peer {
                return Err(TransportError::Handshake(format!(
                    "dialed {peer} but {} answered",
                    answer.node_id
                )));
            }
            write_signal(
                &mut wire,
                &SignalingMessage::Candidate {
                    addr: self.listen_addr.clone(),
                },
            )
            .await?;

            let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
            let (sink, stream) = wire.split();
            let channel = open_channel(sink, peer.clone(), conn_id);
            spawn_reader(stream, peer.clone(), conn_id, channel.open.clone(), events);
            tracing::debug!(peer = %peer, addr = %addr, conn_id, "TCP channel open");
            Ok(Connection::new(answer, Box::new(channel)))
        })
    }

    fn unbind(&self) {
        if let Some(bound) = lock(&self.bound).take() {
            let _ = bound.shutdown.send(true);
        }
    }

    fn known_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.directory)
            .keys()
            .filter(|id| *id != &self.node_id)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn learn_address(&self, peer: &NodeId, addr: &str) {
        if peer == &self.node_id {
            return;
        }
        tracing::debug!(peer = %peer, addr = %addr, "Learned peer address");
        self.add_peer_address(peer.clone(), addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handshake: HandshakeSource,
    events: EventSink,
    next_conn: Arc<AtomicU64>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                };
                let handshake = handshake.clone();
                let events = events.clone();
                let conn_id = next_conn.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    let answered = tokio::time::timeout(
                        handshake_timeout,
                        answer_incoming(stream, handshake, events, conn_id),
                    )
                    .await;
                    match answered {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(remote = %remote_addr, error = %e, "Inbound handshake failed"),
                        Err(_) => tracing::warn!(remote = %remote_addr, "Inbound handshake timed out"),
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::debug!("TCP accept loop stopped");
                break;
            }
        }
    }
}

async fn answer_incoming(
    stream: TcpStream,
    handshake: HandshakeSource,
    events: EventSink,
    conn_id: u64,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut wire = Framed::new(stream, frame_codec());
    let offer = match read_signal(&mut wire).await? {
        SignalingMessage::Offer { handshake } => handshake,
        other => {
            let reject = SignalingMessage::Reject {
                reason: "expected offer".into(),
            };
            let _ = write_signal(&mut wire, &reject).await;
            return Err(TransportError::Handshake(format!("expected offer, got {other:?}")));
        }
    };
    write_signal(&mut wire, &SignalingMessage::Answer { handshake: handshake() }).await?;

    let candidate = match read_signal(&mut wire).await? {
        SignalingMessage::Candidate { addr } => Some(addr),
        _ => None,
    };

    // The Incoming event must reach the node before any frame of this channel.
    let peer = offer.node_id.clone();
    let (sink, stream) = wire.split();
    let channel = open_channel(sink, peer.clone(), conn_id);
    let open = channel.open.clone();
    let mut conn = Connection::new(offer, Box::new(channel));
    if let Some(addr) = candidate {
        conn = conn.with_candidate(addr);
    }
    events
        .send(TransportEvent::Incoming(conn))
        .map_err(|_| TransportError::NotBound)?;
    spawn_reader(stream, peer, conn_id, open, events);
    Ok(())
}

/// Spawn the writer task draining the channel's outbound queue.
fn open_channel(mut sink: SplitSink<Wire, Bytes>, peer: NodeId, conn_id: u64) -> TcpChannel {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let (close_tx, mut close_rx) = watch::channel(false);
    let open = Arc::new(AtomicBool::new(true));

    let writer_peer = peer.clone();
    let writer_open = open.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(peer = %writer_peer, error = %e, "TCP write failed");
                        writer_open.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
        let _ = sink.close().await;
    });

    TcpChannel {
        peer,
        conn_id,
        tx,
        open,
        close_tx,
    }
}

/// Spawn the reader task feeding inbound frames of one channel into `events`.
fn spawn_reader(
    mut stream: SplitStream<Wire>,
    peer: NodeId,
    conn_id: u64,
    open: Arc<AtomicBool>,
    events: EventSink,
) {
    tokio::spawn(async move {
        let reason = loop {
            match stream.next().await {
                Some(Ok(data)) => {
                    let event = TransportEvent::Frame {
                        peer: peer.clone(),
                        conn_id,
                        data: data.freeze(),
                    };
                    if events.send(event).is_err() {
                        break "event loop stopped".to_string();
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed".to_string(),
            }
        };
        // Only report closure that we did not initiate ourselves.
        if open.swap(false, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Closed {
                peer,
                conn_id,
                reason,
            });
        }
    });
}

struct TcpChannel {
    peer: NodeId,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

impl TransportChannel for TcpChannel {
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
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed(self.peer.clone()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.close_tx.send(true);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

async fn write_signal(wire: &mut Wire, msg: &SignalingMessage) -> Result<(), TransportError> {
    let data = serde_json::to_vec(msg).map_err(ProtocolError::from)?;
    wire.send(Bytes::from(data)).await?;
    Ok(())
}

async fn read_signal(wire: &mut Wire) -> Result<SignalingMessage, TransportError> {
    let data = match wire.next().await {
        Some(frame) => frame?,
        None => return Err(TransportError::Handshake("connection closed during signaling".into())),
    };
    serde_json::from_slice(&data)
        .map_err(|e| TransportError::Handshake(format!("malformed signaling message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn source(id: &str, addr: &str) -> HandshakeSource {
        let id = NodeId::new(id);
        let addr = addr.to_string();
        Arc::new(move || Handshake::new(id.clone(), Some(addr.clone())))
    }

    async fn free_addr() -> String {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().to_string()
    }

    async fn listening(id: &str, timeout: Duration) -> (TcpTransport, String, mpsc::UnboundedReceiver<TransportEvent>) {
        let addr = free_addr().await;
        let t = TcpTransport::new(NodeId::new(id), addr.clone(), HashMap::new()).with_handshake_timeout(timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        t.bind(source(id, &addr), tx).await.unwrap();
        (t, addr, rx)
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let mut raw = a;
        raw.write_u32((MAX_FRAME_BYTES + 1) as u32).await.unwrap();
        let mut framed = Framed::new(b, frame_codec());
        assert!(matches!(framed.next().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn test_tcp_signaling_and_frames() {
        let (b, addr, mut b_rx) = listening("node-b", Duration::from_secs(5)).await;

        let a_addr = free_addr().await;
        let mut directory = HashMap::new();
        directory.insert(NodeId::new("node-b"), addr.clone());
        let a = TcpTransport::new(NodeId::new("node-a"), a_addr.clone(), directory);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        a.bind(source("node-a", &a_addr), a_tx).await.unwrap();

        let conn = a.connect(&NodeId::new("node-b")).await.unwrap();
        assert_eq!(conn.remote.node_id, NodeId::new("node-b"));
        conn.channel.send(Bytes::from_static(b"ping")).unwrap();

        match b_rx.recv().await.unwrap() {
            TransportEvent::Incoming(c) => {
                assert_eq!(c.remote.node_id, NodeId::new("node-a"));
                assert_eq!(c.candidate.as_deref(), Some(a_addr.as_str()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match b_rx.recv().await.unwrap() {
            TransportEvent::Frame { peer, data, .. } => {
                assert_eq!(peer, NodeId::new("node-a"));
                assert_eq!(data.as_ref(), b"ping");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Nothing is learned until the node accepts the handshake.
        assert!(b.peer_address(&NodeId::new("node-a")).is_none());
        b.learn_address(&NodeId::new("node-a"), &a_addr);
        assert_eq!(b.known_peers(), vec![NodeId::new("node-a")]);
        assert_eq!(b.peer_address(&NodeId::new("node-a")), Some(a_addr.clone()));
        a.unbind();
        b.unbind();
    }

    #[tokio::test]
    async fn test_silent_socket_is_dropped_after_timeout() {
        let (b, addr, mut b_rx) = listening("node-b", Duration::from_millis(100)).await;
        let mut silent = TcpStream::connect(addr.as_str()).await.unwrap();

        // The listener gives up and closes the socket; no Incoming is raised.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), tokio::io::AsyncReadExt::read(&mut silent, &mut buf))
            .await
            .expect("listener should close the socket");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(b_rx.try_recv().is_err());
        b.unbind();
    }

    #[tokio::test]
    async fn test_inbound_candidate_is_not_recorded_by_transport() {
        let (b, addr, mut b_rx) = listening("node-b", Duration::from_secs(5)).await;
        b.add_peer_address(NodeId::new("node-c"), "127.0.0.1:7401");

        let stream = TcpStream::connect(addr.as_str()).await.unwrap();
        let mut wire = Framed::new(stream, frame_codec());
        let offer = Handshake::new(NodeId::new("node-c"), None);
        write_signal(&mut wire, &SignalingMessage::Offer { handshake: offer }).await.unwrap();
        assert!(matches!(read_signal(&mut wire).await.unwrap(), SignalingMessage::Answer { .. }));
        write_signal(
            &mut wire,
            &SignalingMessage::Candidate {
                addr: "evil:1".into(),
            },
        )
        .await
        .unwrap();

        match b_rx.recv().await.unwrap() {
            TransportEvent::Incoming(c) => assert_eq!(c.candidate.as_deref(), Some("evil:1")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(b.peer_address(&NodeId::new("node-c")).as_deref(), Some("127.0.0.1:7401"));
        b.unbind();
    }
}
