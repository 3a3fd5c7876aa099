//! Events emitted by the network manager.
//!
//! Listeners are invoked synchronously, in registration order, after the
//! state change that produced the event has been committed. A listener
//! must not block; use [`ChannelListener`] to hand events to another task.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use mesh_consensus::Decision;
use mesh_network::NetworkHealth;
use mesh_protocol::{Envelope, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A peer stopped answering heartbeats and was closed.
    HeartbeatTimeout,
    /// A handshake failed verification.
    HandshakeRejected,
    /// A committed proposal contradicted local state.
    InvariantViolation,
    /// The mesh agreed that a peer is faulty.
    PeerDeclaredFaulty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    PeerConnected {
        peer: NodeId,
    },
    PeerDisconnected {
        peer: NodeId,
        reason: String,
    },
    /// An application or coordination envelope was delivered to this node.
    MessageReceived {
        from: NodeId,
        envelope: Envelope,
    },
    ConsensusReached {
        decision: Decision,
    },
    FaultDetected {
        kind: FaultKind,
        peer: Option<NodeId>,
        detail: String,
    },
    NetworkHealthChanged {
        health: NetworkHealth,
    },
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::MessageReceived { .. } => "message_received",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::FaultDetected { .. } => "fault_detected",
            Self::NetworkHealthChanged { .. } => "network_health_changed",
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &NetworkEvent);
}

impl<F> EventListener for F
where
    F: Fn(&NetworkEvent) + Send + Sync,
{
    fn on_event(&self, event: &NetworkEvent) {
        self(event)
    }
}

/// Forwards every event into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &NetworkEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Ordered listener list plus the lock that serializes dispatch.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    dispatch: Mutex<()>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take the dispatch lock. Held from the end of a critical section until
    /// its events are delivered, so batches never interleave.
    pub(crate) fn order(&self) -> std::sync::MutexGuard<'_, ()> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn dispatch(&self, events: &[NetworkEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for event in events {
            tracing::trace!(event = event.name(), "Dispatching event");
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_preserves_order_across_listeners() {
        let set = ListenerSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            set.add(Arc::new(move |e: &NetworkEvent| {
                seen.lock().unwrap().push(format!("{tag}:{}", e.name()));
            }));
        }
        let (channel, mut rx) = ChannelListener::new();
        set.add(Arc::new(channel));
        assert_eq!(set.len(), 3);

        set.dispatch(&[
            NetworkEvent::PeerConnected { peer: NodeId::new("b") },
            NetworkEvent::PeerDisconnected {
                peer: NodeId::new("b"),
                reason: "test".into(),
            },
        ]);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "first:peer_connected",
                "second:peer_connected",
                "first:peer_disconnected",
                "second:peer_disconnected",
            ]
        );
        assert!(matches!(rx.try_recv().unwrap(), NetworkEvent::PeerConnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), NetworkEvent::PeerDisconnected { .. }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(NetworkEvent::FaultDetected {
            kind: FaultKind::HeartbeatTimeout,
            peer: Some(NodeId::new("c")),
            detail: "silent".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "fault_detected");
        assert_eq!(json["kind"], "heartbeat_timeout");
    }
}
