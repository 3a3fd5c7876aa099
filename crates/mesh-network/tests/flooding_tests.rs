//! Flooding over a chain of loopback nodes: A - B - C.

use std::sync::Arc;

use chrono::Utc;
use mesh_network::{
    LoopbackHub, MessageRouter, NetworkError, PeerRegistry, RateLimiter, RouteDecision, Transport,
    TransportEvent,
};
use mesh_protocol::{Handshake, MessageBody, NodeId};
use tokio::sync::mpsc;

struct TestNode {
    id: NodeId,
    registry: PeerRegistry,
    router: MessageRouter,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

async fn node(hub: &LoopbackHub, id: &str) -> (TestNode, mesh_network::LoopbackTransport) {
    let node_id = NodeId::new(id);
    let transport = hub.transport(id);
    let (tx, rx) = mpsc::unbounded_channel();
    let hs_id = node_id.clone();
    transport
        .bind(Arc::new(move || Handshake::new(hs_id.clone(), None)), tx)
        .await
        .unwrap();
    let n = TestNode {
        id: node_id.clone(),
        registry: PeerRegistry::new(node_id.clone(), 8),
        router: MessageRouter::new(node_id, 64, RateLimiter::new(100, 100.0)),
        events: rx,
    };
    (n, transport)
}

/// Dial from `a` to `b` and register the channel on both ends.
async fn link(a: &mut TestNode, ta: &mesh_network::LoopbackTransport, b: &mut TestNode) {
    let now = Utc::now();
    let conn = ta.connect(&b.id).await.unwrap();
    a.registry.insert(conn, now).unwrap();
    a.registry.mark_connected(&b.id, now).unwrap();
    match b.events.recv().await.unwrap() {
        TransportEvent::Incoming(conn) => {
            b.registry.insert(conn, now).unwrap();
            b.registry.mark_connected(&a.id, now).unwrap();
        }
        other => panic!("expected incoming, got {other:?}"),
    }
}

/// Drain queued frames, routing and re-flooding them. Returns the number of
/// envelopes delivered locally.
fn pump(n: &mut TestNode) -> usize {
    let mut delivered = 0;
    while let Ok(event) = n.events.try_recv() {
        if let TransportEvent::Frame { peer, data, .. } = event {
            if let RouteDecision::Deliver { forward, .. } = n.router.receive(&peer, &data) {
                delivered += 1;
                if let Some(fwd) = forward {
                    n.router.flood(&n.registry, &fwd, Some(&peer)).unwrap();
                }
            }
        }
    }
    delivered
}

#[tokio::test]
async fn test_ttl_bounds_flood_reach() {
    let hub = LoopbackHub::new();
    let (mut a, ta) = node(&hub, "node-a").await;
    let (mut b, tb) = node(&hub, "node-b").await;
    let (mut c, _tc) = node(&hub, "node-c").await;
    link(&mut a, &ta, &mut b).await;
    link(&mut b, &tb, &mut c).await;

    // ttl 1 reaches the neighbor only.
    let env = a
        .router
        .prepare_broadcast(MessageBody::Application(serde_json::json!("one hop")), 1)
        .unwrap();
    assert_eq!(a.router.flood(&a.registry, &env, None).unwrap().reached, 1);
    assert_eq!(pump(&mut b), 1);
    assert_eq!(pump(&mut c), 0);

    // ttl 2 reaches the second hop, and the echo back to A is suppressed.
    let env = a
        .router
        .prepare_broadcast(MessageBody::Application(serde_json::json!("two hops")), 2)
        .unwrap();
    a.router.flood(&a.registry, &env, None).unwrap();
    assert_eq!(pump(&mut b), 1);
    assert_eq!(pump(&mut c), 1);
    assert_eq!(pump(&mut a), 0);
}

#[tokio::test]
async fn test_ttl_zero_broadcast_never_leaves_sender() {
    let hub = LoopbackHub::new();
    let (mut a, ta) = node(&hub, "node-a").await;
    let (mut b, _tb) = node(&hub, "node-b").await;
    link(&mut a, &ta, &mut b).await;

    let env = a
        .router
        .prepare_broadcast(MessageBody::Application(serde_json::json!("nowhere")), 0);
    assert!(env.is_none());
    assert_eq!(pump(&mut b), 0);
}

#[tokio::test]
async fn test_flood_reports_unreachable_peers() {
    let hub = LoopbackHub::new();
    let (mut a, ta) = node(&hub, "node-a").await;
    let (mut b, _tb) = node(&hub, "node-b").await;
    let (mut c, _tc) = node(&hub, "node-c").await;
    link(&mut a, &ta, &mut b).await;
    link(&mut a, &ta, &mut c).await;

    hub.sever(&b.id);
    let env = a
        .router
        .prepare_broadcast(MessageBody::Application(serde_json::json!("partial")), 2)
        .unwrap();
    let report = a.router.flood(&a.registry, &env, None).unwrap();
    assert_eq!(report.reached, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, b.id);
    assert!(matches!(report.failed[0].1, NetworkError::Transport(_)));
    assert_eq!(a.router.stats().send_failures, 1);
    assert_eq!(pump(&mut b), 0);
    assert_eq!(pump(&mut c), 1);
}
