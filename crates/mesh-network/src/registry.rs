//! Peer registry.
//!
//! Owns one record per known peer together with the only handle to its
//! transport channel. Records move along
//! `Connecting -> Connected <-> Degraded -> Closed`; a closed record is
//! removed immediately, so a reconnect always starts from a fresh record.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use mesh_protocol::{ConnectionState, NodeId};

use crate::transport::{Connection, TransportChannel};
use crate::NetworkError;

/// Weight of a new RTT sample in the moving estimate.
const RTT_ALPHA: f64 = 0.125;

/// Upper bound on remembered churn timestamps.
const MAX_CHURN_EVENTS: usize = 1024;

pub struct PeerRecord {
    pub peer_id: NodeId,
    pub state: ConnectionState,
    pub last_seen: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    /// Smoothed round-trip estimate from heartbeat acks.
    pub rtt_estimate_ms: Option<f64>,
    /// Hex public key presented in a verified handshake.
    pub public_key: Option<String>,
    pub listen_addr: Option<String>,
    channel: Box<dyn TransportChannel>,
}

impl PeerRecord {
    pub fn conn_id(&self) -> u64 {
        self.channel.conn_id()
    }

    fn send(&self, frame: Bytes) -> Result<(), NetworkError> {
        self.channel.send(frame).map_err(NetworkError::from)
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("last_seen", &self.last_seen)
            .field("rtt_estimate_ms", &self.rtt_estimate_ms)
            .field("conn_id", &self.conn_id())
            .finish()
    }
}

/// Transitions performed by a liveness sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub degraded: Vec<NodeId>,
    pub closed: Vec<NodeId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.degraded.is_empty() && self.closed.is_empty()
    }
}

/// `interval * missed`, saturating instead of wrapping for huge counts.
fn silence_limit(interval: Duration, missed: u32) -> Duration {
    i32::try_from(missed)
        .ok()
        .and_then(|n| interval.checked_mul(n))
        .unwrap_or(Duration::MAX)
}

pub struct PeerRegistry {
    local: NodeId,
    max_connections: usize,
    peers: HashMap<NodeId, PeerRecord>,
    /// Timestamps of connect and disconnect events.
    churn: VecDeque<DateTime<Utc>>,
}

impl PeerRegistry {
    pub fn new(local: NodeId, max_connections: usize) -> Self {
        Self {
            local,
            max_connections,
            peers: HashMap::new(),
            churn: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Create a `Connecting` record that takes ownership of the channel.
    ///
    /// On rejection the channel is closed before the error is returned.
    pub fn insert(&mut self, conn: Connection, now: DateTime<Utc>) -> Result<(), NetworkError> {
        let peer_id = conn.remote.node_id.clone();
        let rejection = if peer_id == self.local {
            Some(NetworkError::SelfConnection)
        } else if self.peers.contains_key(&peer_id) {
            Some(NetworkError::AlreadyConnected(peer_id.clone()))
        } else if self.peers.len() >= self.max_connections {
            Some(NetworkError::ConnectionLimit(self.max_connections))
        } else {
            None
        };
        if let Some(err) = rejection {
            conn.channel.close();
            return Err(err);
        }

        let record = PeerRecord {
            peer_id: peer_id.clone(),
            state: ConnectionState::Connecting,
            last_seen: now,
            connected_at: now,
            rtt_estimate_ms: None,
            public_key: conn.remote.public_key.clone(),
            listen_addr: conn.remote.listen_addr.clone(),
            channel: conn.channel,
        };
        self.peers.insert(peer_id, record);
        Ok(())
    }

    /// Finish the handshake of a `Connecting` peer.
    pub fn mark_connected(&mut self, peer: &NodeId, now: DateTime<Utc>) -> Result<(), NetworkError> {
        self.transition(peer, ConnectionState::Connected)?;
        if let Some(record) = self.peers.get_mut(peer) {
            record.connected_at = now;
            record.last_seen = now;
        }
        self.push_churn(now);
        Ok(())
    }

    fn transition(&mut self, peer: &NodeId, next: ConnectionState) -> Result<ConnectionState, NetworkError> {
        let record = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| NetworkError::PeerNotConnected(peer.clone()))?;
        let prev = record.state;
        if !prev.can_transition_to(next) {
            return Err(NetworkError::InvalidTransition {
                peer: peer.clone(),
                from: prev,
                to: next,
            });
        }
        record.state = next;
        tracing::debug!(peer = %peer, from = %prev, to = %next, "Peer state changed");
        Ok(prev)
    }

    /// Record inbound traffic from `peer`. Returns true if this brought a
    /// degraded peer back to `Connected`.
    pub fn touch(&mut self, peer: &NodeId, now: DateTime<Utc>) -> bool {
        let Some(record) = self.peers.get_mut(peer) else {
            return false;
        };
        if now > record.last_seen {
            record.last_seen = now;
        }
        if record.state == ConnectionState::Degraded {
            return self.transition(peer, ConnectionState::Connected).is_ok();
        }
        false
    }

    /// Fold an RTT sample into the peer's moving estimate.
    pub fn record_rtt(&mut self, peer: &NodeId, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        if let Some(record) = self.peers.get_mut(peer) {
            record.rtt_estimate_ms = Some(match record.rtt_estimate_ms {
                Some(prev) => prev + RTT_ALPHA * (sample_ms - prev),
                None => sample_ms,
            });
        }
    }

    /// Close and remove the record of `peer`, closing its channel.
    pub fn close(&mut self, peer: &NodeId, now: DateTime<Utc>) -> Option<PeerRecord> {
        let mut record = self.peers.remove(peer)?;
        let was_connected = record.state != ConnectionState::Connecting;
        record.state = ConnectionState::Closed;
        record.channel.close();
        if was_connected {
            self.push_churn(now);
        }
        tracing::debug!(peer = %peer, "Peer record closed");
        Some(record)
    }

    /// Close `peer` only if its current channel is `conn_id`. Events from a
    /// channel that was already replaced are ignored.
    pub fn close_conn(&mut self, peer: &NodeId, conn_id: u64, now: DateTime<Utc>) -> Option<PeerRecord> {
        match self.peers.get(peer) {
            Some(record) if record.conn_id() == conn_id => self.close(peer, now),
            _ => None,
        }
    }

    pub fn close_all(&mut self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            self.close(id, now);
        }
        ids
    }

    pub fn get(&self, peer: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn state(&self, peer: &NodeId) -> Option<ConnectionState> {
        self.peers.get(peer).map(|r| r.state)
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.state(peer) == Some(ConnectionState::Connected)
    }

    /// Whether a frame from this channel belongs to the current record.
    pub fn is_current(&self, peer: &NodeId, conn_id: u64) -> bool {
        self.peers.get(peer).is_some_and(|r| r.conn_id() == conn_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Peers in `Connected` state, sorted.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers_where(|s| s == ConnectionState::Connected)
    }

    /// Peers in `Connected` or `Degraded` state, sorted.
    pub fn live_peers(&self) -> Vec<NodeId> {
        self.peers_where(|s| matches!(s, ConnectionState::Connected | ConnectionState::Degraded))
    }

    fn peers_where(&self, pred: impl Fn(ConnectionState) -> bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .peers
            .values()
            .filter(|r| pred(r.state))
            .map(|r| r.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send a frame to a `Connected` peer. Fails immediately otherwise.
    pub fn send_to(&self, peer: &NodeId, frame: Bytes) -> Result<(), NetworkError> {
        match self.peers.get(peer) {
            Some(record) if record.state == ConnectionState::Connected => record.send(frame),
            _ => Err(NetworkError::PeerNotConnected(peer.clone())),
        }
    }

    /// Send a frame to a `Connected` or `Degraded` peer. Used for liveness
    /// traffic, which must reach degraded peers so they can recover.
    pub fn send_to_live(&self, peer: &NodeId, frame: Bytes) -> Result<(), NetworkError> {
        match self.peers.get(peer) {
            Some(record)
                if matches!(
                    record.state,
                    ConnectionState::Connected | ConnectionState::Degraded
                ) =>
            {
                record.send(frame)
            }
            _ => Err(NetworkError::PeerNotConnected(peer.clone())),
        }
    }

    /// Degrade peers silent for `degraded_after` heartbeat intervals and close
    /// peers silent for `closed_after` intervals. Connecting records that never
    /// finished their handshake are closed after `closed_after` intervals too.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        interval: Duration,
        degraded_after: u32,
        closed_after: u32,
    ) -> SweepReport {
        let degrade_at = silence_limit(interval, degraded_after);
        let close_at = silence_limit(interval, closed_after);
        let mut report = SweepReport::default();

        let mut ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(record) = self.peers.get(&id) else { continue };
            let silent = now - record.last_seen;
            if silent >= close_at {
                report.closed.push(id.clone());
            } else if silent >= degrade_at && record.state == ConnectionState::Connected {
                if self.transition(&id, ConnectionState::Degraded).is_ok() {
                    report.degraded.push(id.clone());
                }
            }
        }
        for id in &report.closed {
            self.close(id, now);
        }
        report
    }

    fn push_churn(&mut self, at: DateTime<Utc>) {
        if self.churn.len() == MAX_CHURN_EVENTS {
            self.churn.pop_front();
        }
        self.churn.push_back(at);
    }

    /// Connect and disconnect events at or after `since`.
    pub fn churn_since(&self, since: DateTime<Utc>) -> usize {
        self.churn.iter().filter(|t| **t >= since).count()
    }

    pub fn prune_churn(&mut self, before: DateTime<Utc>) {
        while self.churn.front().is_some_and(|t| *t < before) {
            self.churn.pop_front();
        }
    }

    /// Mean RTT estimate over live peers that have one.
    pub fn average_rtt_ms(&self) -> Option<f64> {
        let samples: Vec<f64> = self
            .peers
            .values()
            .filter(|r| r.state != ConnectionState::Connecting)
            .filter_map(|r| r.rtt_estimate_ms)
            .collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::TransportError;
    use mesh_protocol::Handshake;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Channel that records frames instead of sending them.
    pub(crate) struct RecordingChannel {
        pub peer: NodeId,
        pub conn_id: u64,
        pub open: Arc<AtomicBool>,
        pub sent: Arc<Mutex<Vec<Bytes>>>,
    }

    impl TransportChannel for RecordingChannel {
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
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn recording_conn(peer: &str, conn_id: u64) -> (Connection, Arc<Mutex<Vec<Bytes>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let conn = Connection::new(
            Handshake::new(NodeId::new(peer), None),
            Box::new(RecordingChannel {
                peer: NodeId::new(peer),
                conn_id,
                open: Arc::new(AtomicBool::new(true)),
                sent: sent.clone(),
            }),
        );
        (conn, sent)
    }

    fn connected(reg: &mut PeerRegistry, peer: &str, now: DateTime<Utc>) {
        let (conn, _) = recording_conn(peer, 1);
        reg.insert(conn, now).unwrap();
        reg.mark_connected(&NodeId::new(peer), now).unwrap();
    }

    #[test]
    fn test_insert_and_connect() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let now = Utc::now();
        let (conn, _) = recording_conn("node-b", 1);
        reg.insert(conn, now).unwrap();
        assert_eq!(reg.state(&NodeId::new("node-b")), Some(ConnectionState::Connecting));
        assert!(reg.connected_peers().is_empty());
        reg.mark_connected(&NodeId::new("node-b"), now).unwrap();
        assert_eq!(reg.connected_peers(), vec![NodeId::new("node-b")]);
    }

    #[test]
    fn test_duplicate_and_limit_rejected() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 1);
        let now = Utc::now();
        connected(&mut reg, "node-b", now);
        let (dup, _) = recording_conn("node-b", 2);
        assert!(matches!(reg.insert(dup, now), Err(NetworkError::AlreadyConnected(_))));
        let (extra, _) = recording_conn("node-c", 3);
        assert!(matches!(reg.insert(extra, now), Err(NetworkError::ConnectionLimit(1))));
        let (me, _) = recording_conn("local", 4);
        assert!(matches!(reg.insert(me, now), Err(NetworkError::SelfConnection)));
    }

    #[test]
    fn test_send_requires_connected() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let now = Utc::now();
        let (conn, sent) = recording_conn("node-b", 1);
        reg.insert(conn, now).unwrap();
        let peer = NodeId::new("node-b");
        assert!(reg.send_to(&peer, Bytes::from_static(b"x")).is_err());
        reg.mark_connected(&peer, now).unwrap();
        reg.send_to(&peer, Bytes::from_static(b"x")).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        reg.close(&peer, now);
        assert!(matches!(
            reg.send_to(&peer, Bytes::from_static(b"x")),
            Err(NetworkError::PeerNotConnected(_))
        ));
    }

    #[test]
    fn test_sweep_degrades_then_closes_once() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let t0 = Utc::now();
        connected(&mut reg, "node-b", t0);
        let peer = NodeId::new("node-b");
        let interval = Duration::milliseconds(100);

        let r = reg.sweep(t0 + Duration::milliseconds(150), interval, 3, 6);
        assert!(r.is_empty());

        let r = reg.sweep(t0 + Duration::milliseconds(350), interval, 3, 6);
        assert_eq!(r.degraded, vec![peer.clone()]);
        assert!(reg.send_to(&peer, Bytes::new()).is_err());
        assert!(reg.send_to_live(&peer, Bytes::new()).is_ok());

        let r = reg.sweep(t0 + Duration::milliseconds(650), interval, 3, 6);
        assert_eq!(r.closed, vec![peer.clone()]);
        assert!(reg.get(&peer).is_none());

        let r = reg.sweep(t0 + Duration::milliseconds(950), interval, 3, 6);
        assert!(r.is_empty());
    }

    #[test]
    fn test_huge_missed_counts_never_close_fresh_peers() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let t0 = Utc::now();
        connected(&mut reg, "node-b", t0);
        let r = reg.sweep(
            t0 + Duration::milliseconds(1),
            Duration::milliseconds(1000),
            3,
            3_000_000_000,
        );
        assert!(r.closed.is_empty());
        assert_eq!(reg.state(&NodeId::new("node-b")), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_touch_recovers_degraded_peer() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let t0 = Utc::now();
        connected(&mut reg, "node-b", t0);
        let peer = NodeId::new("node-b");
        reg.sweep(t0 + Duration::milliseconds(300), Duration::milliseconds(100), 3, 6);
        assert_eq!(reg.state(&peer), Some(ConnectionState::Degraded));
        assert!(reg.touch(&peer, t0 + Duration::milliseconds(310)));
        assert_eq!(reg.state(&peer), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_stale_conn_close_is_ignored() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let now = Utc::now();
        connected(&mut reg, "node-b", now);
        assert!(reg.close_conn(&NodeId::new("node-b"), 99, now).is_none());
        assert!(reg.close_conn(&NodeId::new("node-b"), 1, now).is_some());
    }

    #[test]
    fn test_rtt_estimate_is_smoothed() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let now = Utc::now();
        connected(&mut reg, "node-b", now);
        let peer = NodeId::new("node-b");
        reg.record_rtt(&peer, 100.0);
        reg.record_rtt(&peer, 200.0);
        let rtt = reg.get(&peer).unwrap().rtt_estimate_ms.unwrap();
        assert!((rtt - 112.5).abs() < 1e-9);
        assert_eq!(reg.average_rtt_ms(), Some(rtt));
    }

    #[test]
    fn test_churn_window() {
        let mut reg = PeerRegistry::new(NodeId::new("local"), 4);
        let t0 = Utc::now();
        connected(&mut reg, "node-b", t0);
        reg.close(&NodeId::new("node-b"), t0 + Duration::seconds(10));
        assert_eq!(reg.churn_since(t0), 2);
        assert_eq!(reg.churn_since(t0 + Duration::seconds(5)), 1);
        reg.prune_churn(t0 + Duration::seconds(5));
        assert_eq!(reg.churn_since(t0), 1);
    }
}
