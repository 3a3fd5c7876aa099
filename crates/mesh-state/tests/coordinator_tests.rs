//! Coordinator behaviour under duplicated and reordered delivery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use mesh_protocol::{
    AgentId, AgentStatus, CoordinationMessage, CoordinationPayload, NodeId, ProposalData,
    ResourceSpec,
};
use mesh_state::{
    AgentCoordinator, AgentStore, CoordinationOutcome, CoordinatorConfig, InMemoryLifecycle,
    InMemoryStore,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn coordinator(id: &str) -> (AgentCoordinator, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let c = AgentCoordinator::new(
        NodeId::new(id),
        CoordinatorConfig::default(),
        Arc::new(InMemoryLifecycle::new()),
        store.clone(),
    );
    (c, store)
}

fn script() -> Vec<CoordinationMessage> {
    let client = NodeId::new("client");
    let t0 = Utc::now();
    let mut msgs = Vec::new();
    for i in 0..4 {
        msgs.push(
            CoordinationMessage::spawn(client.clone(), AgentId::new(format!("a{i}")), "worker", ResourceSpec::cpu(2.0))
                .at(t0),
        );
    }
    msgs.push(CoordinationMessage::terminate(client.clone(), AgentId::new("a3")).at(t0 + Duration::seconds(1)));
    msgs.push(
        CoordinationMessage::new(
            client,
            AgentId::new("a0"),
            CoordinationPayload::StatusUpdate {
                progress: Some(42),
                resource_usage: None,
            },
        )
        .at(t0 + Duration::seconds(2)),
    );
    msgs
}

#[test]
fn test_duplicates_apply_once() {
    let msgs = script();
    let (mut reference, _) = coordinator("node-a");
    for m in &msgs {
        reference.apply(m, Utc::now()).unwrap();
    }

    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut c, _) = coordinator("node-a");
        // Apply the script in order, re-delivering random earlier messages.
        for (i, m) in msgs.iter().enumerate() {
            c.apply(m, Utc::now()).unwrap();
            for _ in 0..rng.gen_range(0..3) {
                let earlier = &msgs[rng.gen_range(0..=i)];
                assert!(matches!(
                    c.apply(earlier, Utc::now()).unwrap(),
                    CoordinationOutcome::Duplicate { .. }
                ));
            }
        }
        let mut dupes = msgs.clone();
        dupes.shuffle(&mut rng);
        for m in &dupes {
            assert!(matches!(
                c.apply(m, Utc::now()).unwrap(),
                CoordinationOutcome::Duplicate { .. }
            ));
        }

        let ids: Vec<_> = c.local_agents().into_iter().map(|r| r.id).collect();
        let expected: Vec<_> = reference.local_agents().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, expected, "seed {seed}");
        assert_eq!(c.ledger().allocated(), reference.ledger().allocated());
        assert_eq!(c.get(&AgentId::new("a0")).unwrap().progress, 42);
        assert_eq!(c.get(&AgentId::new("a3")).unwrap().status, AgentStatus::Terminated);
    }
}

#[test]
fn test_status_updates_converge_regardless_of_order() {
    let t0 = Utc::now();
    let updates: Vec<CoordinationMessage> = (1..=6u8)
        .map(|i| {
            CoordinationMessage::new(
                NodeId::new("client"),
                AgentId::new("a1"),
                CoordinationPayload::StatusUpdate {
                    progress: Some(i * 10),
                    resource_usage: None,
                },
            )
            .at(t0 + Duration::seconds(i as i64))
        })
        .collect();

    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut c, _) = coordinator("node-a");
        c.apply(
            &CoordinationMessage::spawn(NodeId::new("client"), AgentId::new("a1"), "worker", ResourceSpec::cpu(1.0)),
            Utc::now(),
        )
        .unwrap();
        let mut shuffled = updates.clone();
        shuffled.shuffle(&mut rng);
        for m in &shuffled {
            c.apply(m, Utc::now()).unwrap();
        }
        assert_eq!(c.get(&AgentId::new("a1")).unwrap().progress, 60, "seed {seed}");
    }
}

#[test]
fn test_state_is_persisted_and_follows_reassignment() {
    let (mut a, store) = coordinator("node-a");
    a.apply(
        &CoordinationMessage::spawn(NodeId::new("client"), AgentId::new("a1"), "worker", ResourceSpec::cpu(1.0)),
        Utc::now(),
    )
    .unwrap();
    a.apply(
        &CoordinationMessage::new(
            NodeId::new("client"),
            AgentId::new("a1"),
            CoordinationPayload::StatusUpdate {
                progress: Some(70),
                resource_usage: None,
            },
        ),
        Utc::now(),
    )
    .unwrap();
    let saved = store.load(&AgentId::new("a1")).unwrap().unwrap();
    assert_eq!(saved["progress"], 70);

    // Node B shares the store and takes the agent over.
    let mut b = AgentCoordinator::new(
        NodeId::new("node-b"),
        CoordinatorConfig::default(),
        Arc::new(InMemoryLifecycle::new()),
        store.clone(),
    );
    let data = ProposalData::ReassignAgent {
        agent_id: AgentId::new("a1"),
        agent_type: "worker".into(),
        from: NodeId::new("node-a"),
        to: NodeId::new("node-b"),
        requirements: ResourceSpec::cpu(1.0),
    };
    assert!(a.evaluate_proposal(&data, Utc::now()).0);
    assert!(b.evaluate_proposal(&data, Utc::now()).0);
    a.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();
    b.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();

    assert!(a.get(&AgentId::new("a1")).is_none());
    let moved = b.get(&AgentId::new("a1")).unwrap();
    assert_eq!(moved.status, AgentStatus::Active);
    assert_eq!(moved.owner_node, NodeId::new("node-b"));
    assert_eq!(moved.progress, 70);
}
