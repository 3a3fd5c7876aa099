//! The [`NetworkManager`] facade.
//!
//! One manager runs one node. It owns the peer registry, router, consensus
//! engine and agent coordinator behind a single `RwLock`, and a background
//! event loop that consumes transport events and drives the heartbeat,
//! consensus-sweep and health timers.
//!
//! Every mutation happens inside one write critical section. Events and
//! proposal completions produced there are collected and delivered after
//! the lock is released, in production order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use tokio::sync::{mpsc, oneshot, watch, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use mesh_consensus::{ConsensusEngine, ConsensusError, Decision, ProposalRole};
use mesh_network::topology::{compute_health, plan_optimization};
use mesh_network::{
    Connection, HandshakeSource, HealthInputs, MessageRouter, NetworkError, NetworkHealth,
    NetworkTopology, PeerRegistry, RateLimiter, RouteDecision, TopologyAction, TopologyConfig,
    Transport, TransportEvent,
};
use mesh_protocol::crypto;
use mesh_protocol::{
    AgentId, AgentRecord, AgentReleased, AgentSpec, AgentStatus, CoordinationKind, CoordinationMessage,
    CoordinationPayload, CoordinationReply, Envelope, GoodbyeParams, Handshake, HeartbeatParams,
    MessageBody, MessageId, NodeId, ProposalData, ProposalId, ProposalParams, ReplayWindow,
    ReplyStatus, PROTOCOL_VERSION,
};
use mesh_state::{
    AgentCoordinator, AgentLifecycle, AgentStore, CoordinationError, CoordinationOutcome,
    InMemoryLifecycle, InMemoryStore, InferenceEngine, InferenceOutput, NeuralRuntime,
    ResyncReport,
};

use crate::config::{NodeConfig, SignalingEndpoint};
use crate::events::{ChannelListener, EventListener, FaultKind, ListenerSet, NetworkEvent};
use crate::stats::{NodeCounters, NetworkStats};
use crate::NodeError;

/// External services the node delegates agent work to.
#[derive(Clone)]
pub struct Collaborators {
    pub lifecycle: Arc<dyn AgentLifecycle>,
    pub store: Arc<dyn AgentStore>,
    pub inference: Arc<dyn InferenceEngine>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            lifecycle: Arc::new(InMemoryLifecycle::new()),
            store: Arc::new(InMemoryStore::new()),
            inference: Arc::new(NeuralRuntime::new()),
        }
    }
}

/// Who to answer once a proposal raised on behalf of a peer is decided.
struct PendingReply {
    requester: NodeId,
    in_reply_to: MessageId,
    agent_id: AgentId,
    kind: CoordinationKind,
}

struct NodeState {
    registry: PeerRegistry,
    router: MessageRouter,
    consensus: ConsensusEngine,
    coordinator: AgentCoordinator,
    replay: ReplayWindow,
    waiters: HashMap<ProposalId, oneshot::Sender<Decision>>,
    pending_replies: HashMap<ProposalId, PendingReply>,
    last_health: Option<NetworkHealth>,
    counters: NodeCounters,
    started_at: DateTime<Utc>,
}

/// Side effects of one critical section, delivered after the lock drops.
#[derive(Default)]
struct Effects {
    events: Vec<NetworkEvent>,
    completions: Vec<(oneshot::Sender<Decision>, Decision)>,
}

enum Submitted {
    Done(ReplyStatus),
    Proposed(oneshot::Receiver<Decision>),
}

struct Inner {
    config: NodeConfig,
    node_id: NodeId,
    topology: TopologyConfig,
    transport: Arc<dyn Transport>,
    inference: Arc<dyn InferenceEngine>,
    signing_key: Option<SigningKey>,
    state: RwLock<NodeState>,
    listeners: ListenerSet,
    started: AtomicBool,
    ready: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running node. Cheap to clone; all clones share the node.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self, NodeError> {
        Self::with_collaborators(config, transport, Collaborators::default())
    }

    pub fn with_collaborators(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        collaborators: Collaborators,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id();

        let signing_key = if config.enable_secure_transport {
            Some(match &config.identity_key_path {
                Some(path) => crypto::load_or_create_keypair(path)?,
                None => crypto::generate_keypair(),
            })
        } else {
            None
        };

        // Epochs start from the wall clock so a restarted node never reuses
        // an epoch its peers have already seen.
        let start_epoch = Utc::now().timestamp_millis().max(0) as u64;
        let now = Utc::now();
        let state = NodeState {
            registry: PeerRegistry::new(node_id.clone(), config.max_connections),
            router: MessageRouter::new(
                node_id.clone(),
                config.network.dedup_capacity,
                RateLimiter::new(config.network.rate_limit_burst, config.network.rate_limit_per_sec),
            ),
            consensus: ConsensusEngine::new(node_id.clone(), config.consensus_config(), start_epoch),
            coordinator: AgentCoordinator::new(
                node_id.clone(),
                config.coordinator_config(),
                collaborators.lifecycle,
                collaborators.store,
            ),
            replay: ReplayWindow::new(),
            waiters: HashMap::new(),
            pending_replies: HashMap::new(),
            last_health: None,
            counters: NodeCounters::default(),
            started_at: now,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                topology: config.topology_config(),
                node_id,
                transport,
                inference: collaborators.inference,
                signing_key,
                state: RwLock::new(state),
                listeners: ListenerSet::default(),
                started: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                shutdown_tx,
                event_loop: Mutex::new(None),
                config,
            }),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Hex public key presented in handshakes, if secure transport is on.
    pub fn public_key(&self) -> Option<String> {
        self.inner
            .signing_key
            .as_ref()
            .map(|k| hex::encode(k.verifying_key().as_bytes()))
    }

    // ── Lifecycle ──

    /// Bind the transport, start the event loop and dial the configured
    /// peer directory. A node is initialized at most once.
    pub async fn initialize(&self) -> Result<(), NodeError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyInitialized);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.inner.transport.bind(self.handshake_source(), events_tx).await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.inner.state.write().await.started_at = Utc::now();

        let manager = self.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { manager.run_event_loop(events_rx, shutdown).await });
        *self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.inner.ready.store(true, Ordering::SeqCst);

        tracing::info!(
            node_id = %self.inner.node_id,
            secure = self.inner.config.enable_secure_transport,
            signaling = ?self.inner.config.signaling_endpoint,
            "Network manager initialized"
        );

        if self.inner.config.network.connect_on_start {
            for (peer, addr) in self.inner.config.peer_directory() {
                if let Err(e) = self.connect_to_peer(&peer).await {
                    tracing::warn!(peer = %peer, addr = %addr, error = %e, "Initial dial failed");
                }
            }
        }
        Ok(())
    }

    /// Stop the node: cancel in-flight proposals, terminate local agents,
    /// say goodbye to and close every peer, then stop the event loop.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        if !self.inner.ready.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(node_id = %self.inner.node_id, "Shutting down network manager");

        {
            let mut guard = self.inner.state.write().await;
            let st = &mut *guard;
            let now = Utc::now();
            let mut fx = Effects::default();

            for decision in st.consensus.cancel_all(now) {
                self.finalize(st, decision, now, &mut fx);
            }
            // Anyone still waiting gets `ProposalDropped`.
            st.waiters.clear();
            st.pending_replies.clear();

            let terminated = st.coordinator.terminate_all(now);
            self.announce_released(st, now, &mut fx);
            for peer in st.registry.live_peers() {
                self.send_goodbye(st, &peer, "shutdown");
            }
            for peer in st.registry.close_all(now) {
                st.router.forget_peer(&peer);
                fx.events.push(NetworkEvent::PeerDisconnected {
                    peer,
                    reason: "shutdown".into(),
                });
            }
            tracing::info!(terminated = terminated.len(), "Local agents terminated");
            self.emit(guard, fx);
        }

        let _ = self.inner.shutdown_tx.send(true);
        self.inner.transport.unbind();
        let handle = self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event loop task ended abnormally");
            }
        }
        tracing::info!(node_id = %self.inner.node_id, "Network manager stopped");
        Ok(())
    }

    // ── Peers ──

    /// Dial `peer` and wait for the handshake, bounded by the configured
    /// handshake timeout.
    pub async fn connect_to_peer(&self, peer: &NodeId) -> Result<(), NodeError> {
        self.ensure_ready()?;
        if peer == &self.inner.node_id {
            return Err(NetworkError::SelfConnection.into());
        }
        if self.inner.state.read().await.registry.get(peer).is_some() {
            return Err(NetworkError::AlreadyConnected(peer.clone()).into());
        }

        tracing::debug!(peer = %peer, "Dialing peer");
        let dial = self.inner.transport.connect(peer);
        let conn = match tokio::time::timeout(self.inner.config.handshake_timeout(), dial).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(peer = %peer, "Handshake timed out");
                return Err(NetworkError::HandshakeTimeout(peer.clone()).into());
            }
        };

        let mut guard = self.inner.state.write().await;
        let mut fx = Effects::default();
        let result = self.register_outbound(&mut guard, peer, conn, Utc::now(), &mut fx);
        self.emit(guard, fx);
        result
    }

    pub async fn disconnect_peer(&self, peer: &NodeId) -> Result<(), NodeError> {
        self.ensure_ready()?;
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        if st.registry.get(peer).is_none() {
            return Err(NetworkError::PeerNotConnected(peer.clone()).into());
        }
        let now = Utc::now();
        let mut fx = Effects::default();
        self.send_goodbye(st, peer, "disconnect requested");
        st.registry.close(peer, now);
        st.router.forget_peer(peer);
        tracing::info!(peer = %peer, "Disconnected peer");
        fx.events.push(NetworkEvent::PeerDisconnected {
            peer: peer.clone(),
            reason: "disconnect requested".into(),
        });
        self.emit(guard, fx);
        Ok(())
    }

    // ── Messaging ──

    /// Send an application payload to one directly connected peer. Fails
    /// immediately if the peer is not `Connected`.
    pub async fn send_direct_message(&self, peer: &NodeId, payload: serde_json::Value) -> Result<(), NodeError> {
        self.ensure_ready()?;
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let envelope = st.router.prepare_direct(peer.clone(), MessageBody::Application(payload));
        let mut fx = Effects::default();
        let result = self.deliver(st, &envelope, Utc::now(), &mut fx);
        self.emit(guard, fx);
        result?;
        tracing::debug!(peer = %peer, message_id = %envelope.message_id, "Sent direct message");
        Ok(())
    }

    /// Flood an application payload with the default ttl. Returns the
    /// number of peers it was handed to.
    pub async fn broadcast_message(&self, payload: serde_json::Value) -> Result<usize, NodeError> {
        self.broadcast_message_with_ttl(payload, self.inner.config.network.default_ttl)
            .await
    }

    /// A ttl of 0 is accepted and transmits nothing.
    pub async fn broadcast_message_with_ttl(
        &self,
        payload: serde_json::Value,
        ttl: u32,
    ) -> Result<usize, NodeError> {
        self.ensure_ready()?;
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let Some(envelope) = st.router.prepare_broadcast(MessageBody::Application(payload), ttl) else {
            return Ok(0);
        };
        let mut fx = Effects::default();
        let result = self.flood(st, &envelope, None, Utc::now(), &mut fx);
        self.emit(guard, fx);
        let reached = result?;
        tracing::debug!(message_id = %envelope.message_id, ttl, reached, "Broadcast message");
        Ok(reached)
    }

    /// Deliver a coordination message to `peer` for it to apply.
    pub async fn send_coordination(&self, peer: &NodeId, msg: CoordinationMessage) -> Result<(), NodeError> {
        self.ensure_ready()?;
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let envelope = st.router.prepare_direct(peer.clone(), MessageBody::Coordination(msg));
        let mut fx = Effects::default();
        let result = self.deliver(st, &envelope, Utc::now(), &mut fx);
        self.emit(guard, fx);
        Ok(result?)
    }

    // ── Agents ──

    /// Host a new agent on this node. Malformed specs fail before any
    /// state is touched.
    pub async fn register_local_agent(&self, spec: AgentSpec) -> Result<AgentRecord, NodeError> {
        spec.validate().map_err(NodeError::InvalidAgent)?;
        self.ensure_ready()?;
        let msg = CoordinationMessage::new(
            self.inner.node_id.clone(),
            spec.id.clone(),
            CoordinationPayload::Spawn {
                agent_type: spec.agent_type.clone(),
                requirements: spec.requirements,
                config: spec.config.clone(),
            },
        );
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        st.coordinator.apply(&msg, Utc::now())?;
        st.counters.coordination_applied += 1;
        let record = st
            .coordinator
            .get(&spec.id)
            .cloned()
            .ok_or_else(|| CoordinationError::UnknownAgent(spec.id.clone()))?;
        tracing::info!(agent_id = %record.id, agent_type = %record.agent_type, "Registered local agent");
        Ok(record)
    }

    pub async fn unregister_local_agent(&self, agent_id: &AgentId) -> Result<(), NodeError> {
        self.ensure_ready()?;
        let msg = CoordinationMessage::terminate(self.inner.node_id.clone(), agent_id.clone());
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let now = Utc::now();
        st.coordinator.apply(&msg, now)?;
        st.counters.coordination_applied += 1;
        let mut fx = Effects::default();
        self.announce_released(st, now, &mut fx);
        self.emit(guard, fx);
        tracing::info!(agent_id = %agent_id, "Unregistered local agent");
        Ok(())
    }

    /// Live agents hosted here, ordered by id.
    pub async fn get_local_agents(&self) -> Vec<AgentRecord> {
        self.inner.state.read().await.coordinator.local_agents()
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        self.inner.state.read().await.coordinator.get(agent_id).cloned()
    }

    pub async fn is_agent_active(&self, agent_id: &AgentId) -> bool {
        self.inner.state.read().await.coordinator.is_active(agent_id)
    }

    /// Current owner of an agent as far as this node knows.
    pub async fn owner_of(&self, agent_id: &AgentId) -> Option<NodeId> {
        self.inner.state.read().await.coordinator.owner_of(agent_id)
    }

    /// Apply a coordination message on this node. A spawn targeting another
    /// node raises a proposal and waits for its decision.
    pub async fn submit(&self, msg: CoordinationMessage) -> Result<ReplyStatus, NodeError> {
        self.ensure_ready()?;
        let submitted = {
            let mut guard = self.inner.state.write().await;
            let mut fx = Effects::default();
            let result = self.submit_locked(&mut guard, &msg, Utc::now(), &mut fx);
            self.emit(guard, fx);
            result?
        };
        match submitted {
            Submitted::Done(status) => Ok(status),
            Submitted::Proposed(rx) => {
                let decision = rx.await.map_err(|_| NodeError::ProposalDropped)?;
                Ok(decision_status(&decision))
            }
        }
    }

    /// Spawn `agent_id` here (`target` unset or local) or on `target`.
    pub async fn request_spawn(
        &self,
        agent_id: AgentId,
        agent_type: &str,
        target: Option<NodeId>,
        requirements: mesh_protocol::ResourceSpec,
    ) -> Result<ReplyStatus, NodeError> {
        let mut msg = CoordinationMessage::spawn(self.inner.node_id.clone(), agent_id, agent_type, requirements);
        if let Some(target) = target {
            msg = msg.targeting(target);
        }
        self.submit(msg).await
    }

    /// Raise a proposal over the currently connected peers and wait for
    /// its terminal outcome.
    pub async fn propose(&self, data: ProposalData) -> Result<Decision, NodeError> {
        self.ensure_ready()?;
        let rx = {
            let mut guard = self.inner.state.write().await;
            let mut fx = Effects::default();
            let result = self.start_proposal(&mut guard, data, None, Utc::now(), &mut fx);
            self.emit(guard, fx);
            result?.1
        };
        rx.await.map_err(|_| NodeError::ProposalDropped)
    }

    /// Move `agent_id` from `from` to `to` through consensus.
    pub async fn reassign_agent(&self, agent_id: &AgentId, from: &NodeId, to: &NodeId) -> Result<Decision, NodeError> {
        self.ensure_ready()?;
        let data = {
            let st = self.inner.state.read().await;
            let (agent_type, requirements) = if from == &self.inner.node_id {
                let record = st
                    .coordinator
                    .get(agent_id)
                    .ok_or_else(|| CoordinationError::UnknownAgent(agent_id.clone()))?;
                if record.status != AgentStatus::Active {
                    return Err(CoordinationError::AgentNotActive {
                        agent_id: agent_id.clone(),
                        status: record.status,
                    }
                    .into());
                }
                (record.agent_type.clone(), record.requirements)
            } else {
                let remote = st
                    .coordinator
                    .remote_agent(agent_id)
                    .ok_or_else(|| CoordinationError::UnknownAgent(agent_id.clone()))?;
                if &remote.owner != from {
                    return Err(CoordinationError::OwnedElsewhere {
                        agent_id: agent_id.clone(),
                        owner: remote.owner.clone(),
                    }
                    .into());
                }
                (remote.agent_type.clone(), remote.requirements)
            };
            if to != &self.inner.node_id && !st.registry.is_connected(to) {
                return Err(NetworkError::PeerNotConnected(to.clone()).into());
            }
            ProposalData::ReassignAgent {
                agent_id: agent_id.clone(),
                agent_type,
                from: from.clone(),
                to: to.clone(),
                requirements,
            }
        };
        self.propose(data).await
    }

    /// Run the inference collaborator for an active local agent.
    pub async fn run_inference(&self, agent_id: &AgentId, input: &[f32]) -> Result<InferenceOutput, NodeError> {
        {
            let st = self.inner.state.read().await;
            if !st.coordinator.is_active(agent_id) {
                let err = match st.coordinator.get(agent_id) {
                    Some(record) => CoordinationError::AgentNotActive {
                        agent_id: agent_id.clone(),
                        status: record.status,
                    },
                    None => CoordinationError::UnknownAgent(agent_id.clone()),
                };
                return Err(err.into());
            }
        }
        Ok(self.inner.inference.run_inference(agent_id, input).await?)
    }

    /// Clear a coordinator halt after an ownership conflict.
    pub async fn resync(&self) -> ResyncReport {
        self.inner.state.write().await.coordinator.resync()
    }

    // ── Topology ──

    pub async fn get_network_topology(&self) -> NetworkTopology {
        let st = self.inner.state.read().await;
        NetworkTopology::snapshot(&st.registry, Utc::now())
    }

    pub async fn get_network_health(&self) -> NetworkHealth {
        let st = self.inner.state.read().await;
        let now = Utc::now();
        compute_health(&self.health_inputs(&st, now), &self.inner.topology, now)
    }

    pub async fn get_network_stats(&self) -> NetworkStats {
        let st = self.inner.state.read().await;
        let now = Utc::now();
        NetworkStats {
            node_id: self.inner.node_id.clone(),
            started_at: st.started_at,
            uptime_secs: (now - st.started_at).num_seconds().max(0),
            peers_total: st.registry.len(),
            peers_connected: st.registry.connected_peers().len(),
            peers_live: st.registry.live_peers().len(),
            average_rtt_ms: st.registry.average_rtt_ms(),
            local_agents: st.coordinator.live_count(),
            current_epoch: st.consensus.current_epoch(),
            proposals_pending: st.consensus.pending_count(),
            proposals_committed: st.consensus.committed_total(),
            proposals_rejected: st.consensus.rejected_total(),
            coordinator_halted: st.coordinator.is_halted(),
            event_listeners: self.inner.listeners.len(),
            router: st.router.stats().clone(),
            counters: st.counters.clone(),
        }
    }

    /// Plan rebalancing toward the configured degree band and carry it out.
    /// A peer hosting agents this node sponsored is only dropped after all
    /// of them moved elsewhere.
    pub async fn optimize_topology(&self) -> Result<Vec<TopologyAction>, NodeError> {
        self.ensure_ready()?;
        let (actions, live) = {
            let st = self.inner.state.read().await;
            let mut candidates = self.inner.transport.known_peers();
            candidates.extend(self.inner.config.peer_directory().into_iter().map(|(id, _)| id));
            candidates.sort();
            candidates.dedup();
            let actions = plan_optimization(
                &st.registry,
                &candidates,
                &st.coordinator.pinned_peers(),
                &self.inner.topology,
            );
            (actions, st.registry.live_peers())
        };

        let leaving: HashSet<&NodeId> = actions
            .iter()
            .filter_map(|a| match a {
                TopologyAction::Disconnect { peer } | TopologyAction::MigrateThenDisconnect { peer, .. } => Some(peer),
                TopologyAction::Connect { .. } => None,
            })
            .collect();

        for action in &actions {
            match action {
                TopologyAction::Connect { peer } => {
                    if let Err(e) = self.connect_to_peer(peer).await {
                        tracing::warn!(peer = %peer, error = %e, "Topology connect failed");
                    }
                }
                TopologyAction::Disconnect { peer } => {
                    if let Err(e) = self.disconnect_peer(peer).await {
                        tracing::warn!(peer = %peer, error = %e, "Topology disconnect failed");
                    }
                }
                TopologyAction::MigrateThenDisconnect { peer, agents } => {
                    let new_host = live
                        .iter()
                        .find(|p| *p != peer && !leaving.contains(p))
                        .cloned()
                        .unwrap_or_else(|| self.inner.node_id.clone());
                    let mut moved = 0;
                    for agent in agents {
                        match self.reassign_agent(agent, peer, &new_host).await {
                            Ok(decision) if decision.is_committed() => moved += 1,
                            Ok(decision) => tracing::warn!(
                                agent_id = %agent,
                                outcome = %decision.outcome,
                                "Agent migration rejected"
                            ),
                            Err(e) => tracing::warn!(agent_id = %agent, error = %e, "Agent migration failed"),
                        }
                    }
                    if moved == agents.len() {
                        if let Err(e) = self.disconnect_peer(peer).await {
                            tracing::warn!(peer = %peer, error = %e, "Topology disconnect failed");
                        }
                    } else {
                        tracing::warn!(
                            peer = %peer,
                            moved,
                            pinned = agents.len(),
                            "Keeping peer connected, migration incomplete"
                        );
                    }
                }
            }
        }
        tracing::info!(actions = actions.len(), "Topology optimization applied");
        Ok(actions)
    }

    // ── Events ──

    pub fn add_event_listener<L>(&self, listener: L)
    where
        L: EventListener + 'static,
    {
        self.inner.listeners.add(Arc::new(listener));
    }

    /// Receive every subsequent event on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        let (listener, rx) = ChannelListener::new();
        self.add_event_listener(listener);
        rx
    }

    // ── Internals ──

    fn ensure_ready(&self) -> Result<(), NodeError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(NodeError::NotReady)
        }
    }

    fn handshake_source(&self) -> HandshakeSource {
        let node_id = self.inner.node_id.clone();
        let listen_addr = match self.inner.config.signaling_endpoint {
            SignalingEndpoint::Tcp => Some(self.inner.config.network.listen_addr.clone()),
            SignalingEndpoint::Loopback => None,
        };
        let key = self.inner.signing_key.clone();
        Arc::new(move || {
            let mut handshake = Handshake::new(node_id.clone(), listen_addr.clone());
            if let Some(key) = &key {
                crypto::sign_handshake(key, &mut handshake);
            }
            handshake
        })
    }

    /// Release the state lock and deliver what the critical section produced.
    fn emit(&self, guard: RwLockWriteGuard<'_, NodeState>, fx: Effects) {
        let _order = self.inner.listeners.order();
        drop(guard);
        self.inner.listeners.dispatch(&fx.events);
        for (tx, decision) in fx.completions {
            let _ = tx.send(decision);
        }
    }

    fn health_inputs(&self, st: &NodeState, now: DateTime<Utc>) -> HealthInputs {
        HealthInputs {
            connected: st.registry.connected_peers().len(),
            avg_rtt_ms: st.registry.average_rtt_ms(),
            churn_events: st.registry.churn_since(now - self.inner.topology.churn_window),
            last_commit_at: st.consensus.last_commit_at(),
            rejections_since_commit: st.consensus.rejections_since_commit(),
            started_at: st.started_at,
        }
    }

    fn verify_handshake(&self, st: &mut NodeState, handshake: &Handshake) -> Result<(), String> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(format!("unsupported protocol version {}", handshake.protocol_version));
        }
        if handshake.node_id.is_blank() {
            return Err("empty node id".into());
        }
        if self.inner.config.enable_secure_transport {
            crypto::verify_handshake(handshake).map_err(|e| e.to_string())?;
            st.replay
                .check_and_insert(&handshake.nonce, handshake.timestamp)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn register_outbound(
        &self,
        st: &mut NodeState,
        peer: &NodeId,
        conn: Connection,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> Result<(), NodeError> {
        if &conn.remote.node_id != peer {
            conn.channel.close();
            return Err(NodeError::HandshakeRejected {
                peer: peer.clone(),
                reason: format!("answered as {}", conn.remote.node_id),
            });
        }
        if let Err(reason) = self.verify_handshake(st, &conn.remote) {
            conn.channel.close();
            tracing::warn!(peer = %peer, reason = %reason, "Rejected handshake answer");
            st.counters.faults_detected += 1;
            fx.events.push(NetworkEvent::FaultDetected {
                kind: FaultKind::HandshakeRejected,
                peer: Some(peer.clone()),
                detail: reason.clone(),
            });
            return Err(NodeError::HandshakeRejected {
                peer: peer.clone(),
                reason,
            });
        }
        st.registry.insert(conn, now)?;
        st.registry.mark_connected(peer, now)?;
        tracing::info!(peer = %peer, "Peer connected");
        fx.events.push(NetworkEvent::PeerConnected { peer: peer.clone() });
        Ok(())
    }

    fn accept_incoming(&self, st: &mut NodeState, mut conn: Connection, now: DateTime<Utc>, fx: &mut Effects) {
        let peer = conn.remote.node_id.clone();
        let candidate = conn.candidate.take();
        if let Err(reason) = self.verify_handshake(st, &conn.remote) {
            conn.channel.close();
            tracing::warn!(peer = %peer, reason = %reason, "Rejected inbound handshake");
            st.counters.faults_detected += 1;
            fx.events.push(NetworkEvent::FaultDetected {
                kind: FaultKind::HandshakeRejected,
                peer: Some(peer),
                detail: reason,
            });
            return;
        }
        if let Err(e) = st.registry.insert(conn, now) {
            tracing::warn!(peer = %peer, error = %e, "Refused inbound connection");
            return;
        }
        if let Err(e) = st.registry.mark_connected(&peer, now) {
            tracing::warn!(peer = %peer, error = %e, "Inbound connection failed to complete");
            st.registry.close(&peer, now);
            return;
        }
        // Only a verified peer may point the directory at a dial-back address.
        if let Some(addr) = candidate {
            self.inner.transport.learn_address(&peer, &addr);
        }
        tracing::info!(peer = %peer, "Peer connected (inbound)");
        fx.events.push(NetworkEvent::PeerConnected { peer });
    }

    /// Send on a `Connected` or `Degraded` channel, bypassing router stats.
    fn send_live(&self, st: &mut NodeState, peer: &NodeId, body: MessageBody) -> bool {
        let envelope = st.router.prepare_direct(peer.clone(), body);
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to encode envelope");
                return false;
            }
        };
        match st.registry.send_to_live(peer, frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Send to peer failed");
                false
            }
        }
    }

    fn send_goodbye(&self, st: &mut NodeState, peer: &NodeId, reason: &str) {
        let body = MessageBody::Goodbye(GoodbyeParams {
            node_id: self.inner.node_id.clone(),
            reason: reason.to_string(),
        });
        self.send_live(st, peer, body);
    }

    fn submit_locked(
        &self,
        st: &mut NodeState,
        msg: &CoordinationMessage,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> Result<Submitted, NodeError> {
        if let (CoordinationKind::Spawn, Some(target)) = (msg.kind(), &msg.target_node) {
            if target != &self.inner.node_id && !st.registry.is_connected(target) {
                return Err(NetworkError::PeerNotConnected(target.clone()).into());
            }
        }
        let outcome = match st.coordinator.apply(msg, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                st.counters.coordination_failed += 1;
                return Err(e.into());
            }
        };
        match outcome {
            CoordinationOutcome::NeedsConsensus(data) => {
                let (_, rx) = self.start_proposal(st, data, None, now, fx)?;
                Ok(Submitted::Proposed(rx))
            }
            outcome => {
                st.counters.coordination_applied += 1;
                self.announce_released(st, now, fx);
                let status = outcome.reply_status().unwrap_or(ReplyStatus::Applied {
                    detail: "applied".into(),
                });
                Ok(Submitted::Done(status))
            }
        }
    }

    /// Raise a proposal. This node votes first; refusing its own proposal
    /// is an error rather than a rejected round.
    fn start_proposal(
        &self,
        st: &mut NodeState,
        data: ProposalData,
        reply_to: Option<PendingReply>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> Result<(ProposalId, oneshot::Receiver<Decision>), NodeError> {
        let (approve, reason) = match &data {
            ProposalData::DeclareFaulty { .. } => (true, None),
            other => st.coordinator.evaluate_proposal(other, now),
        };
        if !approve {
            return Err(NodeError::ProposalRefused(
                reason.unwrap_or_else(|| "refused by local coordinator".into()),
            ));
        }

        let peers = st.registry.connected_peers();
        let (params, immediate) = match st.consensus.propose(data.clone(), &peers, now) {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(undo) = st.coordinator.apply_decision(&self.inner.node_id, &data, false, now) {
                    tracing::warn!(error = %undo, "Failed to release reservation of unopened proposal");
                }
                return Err(e.into());
            }
        };
        st.counters.proposals_started += 1;
        tracing::info!(
            proposal_id = %params.proposal_id,
            epoch = params.epoch,
            kind = params.data.label(),
            electorate = params.electorate.len(),
            quorum = params.quorum,
            "Proposal raised"
        );

        let (tx, rx) = oneshot::channel();
        st.waiters.insert(params.proposal_id.clone(), tx);
        if let Some(pending) = reply_to {
            st.pending_replies.insert(params.proposal_id.clone(), pending);
        }
        for member in params.electorate.iter().filter(|m| **m != self.inner.node_id) {
            let envelope = st
                .router
                .prepare_direct(member.clone(), MessageBody::Proposal(params.clone()));
            if let Err(e) = self.deliver(st, &envelope, now, fx) {
                tracing::warn!(peer = %member, proposal_id = %params.proposal_id, error = %e, "Failed to send proposal");
            }
        }
        if let Some(decision) = immediate {
            self.finalize(st, decision, now, fx);
        }
        Ok((params.proposal_id, rx))
    }

    /// Apply a terminal decision everywhere it matters on this node.
    fn finalize(&self, st: &mut NodeState, decision: Decision, now: DateTime<Utc>, fx: &mut Effects) {
        let committed = decision.is_committed();

        if decision.role == ProposalRole::Proposer {
            let commit = MessageBody::Commit(decision.commit_params());
            for member in decision.electorate.iter().filter(|m| **m != self.inner.node_id) {
                let envelope = st.router.prepare_direct(member.clone(), commit.clone());
                if let Err(e) = self.deliver(st, &envelope, now, fx) {
                    tracing::debug!(peer = %member, error = %e, "Could not deliver commit; peer will expire it");
                }
            }
        }

        if let Err(e) = st
            .coordinator
            .apply_decision(&decision.proposer, &decision.data, committed, now)
        {
            tracing::error!(proposal_id = %decision.proposal_id, error = %e, "Decision conflicts with local state");
            st.counters.faults_detected += 1;
            fx.events.push(NetworkEvent::FaultDetected {
                kind: FaultKind::InvariantViolation,
                peer: None,
                detail: e.to_string(),
            });
        }

        if let (true, ProposalData::DeclareFaulty { peer }) = (committed, &decision.data) {
            if peer != &self.inner.node_id {
                if st.registry.close(peer, now).is_some() {
                    st.router.forget_peer(peer);
                    fx.events.push(NetworkEvent::PeerDisconnected {
                        peer: peer.clone(),
                        reason: "declared faulty".into(),
                    });
                }
                st.counters.faults_detected += 1;
                fx.events.push(NetworkEvent::FaultDetected {
                    kind: FaultKind::PeerDeclaredFaulty,
                    peer: Some(peer.clone()),
                    detail: format!("proposal {} committed", decision.proposal_id),
                });
            }
        }

        if let Some(pending) = st.pending_replies.remove(&decision.proposal_id) {
            let status = decision_status(&decision);
            let reply = reply_body(&self.inner.node_id, pending.in_reply_to, pending.agent_id, pending.kind, status);
            self.reply(st, &pending.requester, reply, now, fx);
        }

        tracing::info!(
            proposal_id = %decision.proposal_id,
            outcome = %decision.outcome,
            reason = ?decision.reason,
            kind = decision.data.label(),
            "Consensus reached"
        );
        if let Some(tx) = st.waiters.remove(&decision.proposal_id) {
            fx.completions.push((tx, decision.clone()));
        }
        fx.events.push(NetworkEvent::ConsensusReached { decision });
    }

    fn reply(&self, st: &mut NodeState, to: &NodeId, body: MessageBody, now: DateTime<Utc>, fx: &mut Effects) {
        if to == &self.inner.node_id {
            return;
        }
        let envelope = st.router.prepare_direct(to.clone(), body);
        if let Err(e) = self.deliver(st, &envelope, now, fx) {
            tracing::debug!(peer = %to, error = %e, "Could not deliver coordination reply");
        }
    }

    /// Send a targeted envelope. A channel that fails underneath a
    /// `Connected` record closes the peer.
    fn deliver(
        &self,
        st: &mut NodeState,
        envelope: &Envelope,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> Result<(), NetworkError> {
        let result = st.router.send_direct(&st.registry, envelope);
        if let (Err(e), Some(peer)) = (&result, &envelope.target) {
            self.close_after_send_failure(st, peer, e, now, fx);
        }
        result
    }

    /// Flood a broadcast envelope, closing every peer whose channel failed.
    fn flood(
        &self,
        st: &mut NodeState,
        envelope: &Envelope,
        except: Option<&NodeId>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> Result<usize, NetworkError> {
        let report = st.router.flood(&st.registry, envelope, except)?;
        for (peer, e) in &report.failed {
            self.close_after_send_failure(st, peer, e, now, fx);
        }
        Ok(report.reached)
    }

    fn close_after_send_failure(
        &self,
        st: &mut NodeState,
        peer: &NodeId,
        error: &NetworkError,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let NetworkError::Transport(e) = error else {
            return;
        };
        if st.registry.close(peer, now).is_some() {
            st.router.forget_peer(peer);
            tracing::warn!(peer = %peer, error = %e, "Closing peer after send failure");
            fx.events.push(NetworkEvent::PeerDisconnected {
                peer: peer.clone(),
                reason: format!("transport error: {e}"),
            });
        }
    }

    /// Tell the mesh about local agents that are gone so sponsors and
    /// other directories stop naming this node as their owner.
    fn announce_released(&self, st: &mut NodeState, now: DateTime<Utc>, fx: &mut Effects) {
        for agent_id in st.coordinator.take_released() {
            let body = MessageBody::AgentReleased(AgentReleased {
                agent_id: agent_id.clone(),
                owner: self.inner.node_id.clone(),
            });
            let Some(envelope) = st.router.prepare_broadcast(body, self.inner.config.network.default_ttl) else {
                continue;
            };
            if let Err(e) = self.flood(st, &envelope, None, now, fx) {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to announce released agent");
            }
        }
    }

    // ── Event loop ──

    async fn run_event_loop(
        self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.inner.config.heartbeat_interval());
        let mut consensus_sweep = tokio::time::interval(self.inner.config.sweep_interval());
        let mut health = tokio::time::interval(self.inner.config.health_interval());
        for timer in [&mut heartbeat, &mut consensus_sweep, &mut health] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        tracing::debug!(node_id = %self.inner.node_id, "Event loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_transport_event(event).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat_tick().await;
                }
                _ = consensus_sweep.tick() => {
                    self.consensus_tick().await;
                }
                _ = health.tick() => {
                    self.health_tick().await;
                }
            }
        }
        tracing::debug!(node_id = %self.inner.node_id, "Event loop stopped");
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let now = Utc::now();
        let mut fx = Effects::default();
        match event {
            TransportEvent::Incoming(conn) => self.accept_incoming(st, conn, now, &mut fx),
            TransportEvent::Frame { peer, conn_id, data } => {
                self.handle_frame(st, &peer, conn_id, &data, now, &mut fx)
            }
            TransportEvent::Closed { peer, conn_id, reason } => {
                if st.registry.close_conn(&peer, conn_id, now).is_some() {
                    st.router.forget_peer(&peer);
                    tracing::info!(peer = %peer, reason = %reason, "Peer disconnected");
                    fx.events.push(NetworkEvent::PeerDisconnected { peer, reason });
                }
            }
        }
        self.emit(guard, fx);
    }

    fn handle_frame(
        &self,
        st: &mut NodeState,
        peer: &NodeId,
        conn_id: u64,
        data: &[u8],
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        if !st.registry.is_current(peer, conn_id) {
            tracing::trace!(peer = %peer, conn_id, "Ignoring frame from stale channel");
            return;
        }
        if st.registry.touch(peer, now) {
            tracing::info!(peer = %peer, "Peer recovered");
        }
        let (envelope, forward) = match st.router.receive(peer, data) {
            RouteDecision::Deliver { envelope, forward } => (envelope, forward),
            RouteDecision::Drop(reason) => {
                tracing::debug!(peer = %peer, reason = reason.as_str(), "Dropped inbound frame");
                return;
            }
        };
        if let Some(forward) = forward {
            if let Err(e) = self.flood(st, &forward, Some(peer), now, fx) {
                tracing::warn!(message_id = %forward.message_id, error = %e, "Failed to forward broadcast");
            }
        }
        self.handle_envelope(st, peer, envelope, now, fx);
    }

    fn handle_envelope(
        &self,
        st: &mut NodeState,
        from: &NodeId,
        envelope: Envelope,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let visible = match &envelope.body {
            MessageBody::Heartbeat(probe) => {
                st.counters.heartbeats_received += 1;
                let ack = MessageBody::HeartbeatAck(HeartbeatParams {
                    node_id: self.inner.node_id.clone(),
                    sent_at: probe.sent_at,
                    local_agents: st.coordinator.live_count(),
                });
                self.send_live(st, from, ack);
                false
            }
            MessageBody::HeartbeatAck(ack) => {
                let micros = (now - ack.sent_at).num_microseconds().unwrap_or(i64::MAX).max(0);
                st.registry.record_rtt(from, micros as f64 / 1000.0);
                false
            }
            MessageBody::Goodbye(bye) => {
                if st.registry.close(from, now).is_some() {
                    st.router.forget_peer(from);
                    tracing::info!(peer = %from, reason = %bye.reason, "Peer said goodbye");
                    fx.events.push(NetworkEvent::PeerDisconnected {
                        peer: from.clone(),
                        reason: format!("goodbye: {}", bye.reason),
                    });
                }
                false
            }
            MessageBody::Coordination(msg) => {
                self.handle_remote_coordination(st, &envelope.origin, msg, now, fx);
                true
            }
            MessageBody::CoordinationReply(reply) => {
                tracing::debug!(
                    responder = %reply.responder,
                    in_reply_to = %reply.in_reply_to,
                    status = ?reply.status,
                    "Coordination reply"
                );
                true
            }
            MessageBody::AgentReleased(notice) => {
                if notice.owner == envelope.origin {
                    st.coordinator.forget_remote(&notice.agent_id, &notice.owner);
                } else {
                    tracing::warn!(
                        origin = %envelope.origin,
                        owner = %notice.owner,
                        agent_id = %notice.agent_id,
                        "Ignoring release announced on behalf of another node"
                    );
                }
                false
            }
            MessageBody::Proposal(params) => {
                self.handle_proposal(st, params, now, fx);
                false
            }
            MessageBody::Vote(vote) => {
                match st.consensus.record_vote(vote, now) {
                    Ok(Some(decision)) => self.finalize(st, decision, now, fx),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(voter = %vote.voter, proposal_id = %vote.proposal_id, error = %e, "Ignoring vote")
                    }
                }
                false
            }
            MessageBody::Commit(commit) => {
                match st.consensus.apply_commit(commit, now) {
                    Ok(Some(decision)) => self.finalize(st, decision, now, fx),
                    Ok(None) => {}
                    Err(e @ ConsensusError::OutcomeConflict { .. }) => {
                        tracing::error!(proposal_id = %commit.proposal_id, error = %e, "Conflicting commit");
                        st.counters.faults_detected += 1;
                        fx.events.push(NetworkEvent::FaultDetected {
                            kind: FaultKind::InvariantViolation,
                            peer: Some(from.clone()),
                            detail: e.to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::debug!(proposal_id = %commit.proposal_id, error = %e, "Ignoring commit")
                    }
                }
                false
            }
            MessageBody::Application(_) => true,
        };
        if visible {
            fx.events.push(NetworkEvent::MessageReceived {
                from: from.clone(),
                envelope,
            });
        }
    }

    fn handle_remote_coordination(
        &self,
        st: &mut NodeState,
        origin: &NodeId,
        msg: &CoordinationMessage,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let status = match st.coordinator.apply(msg, now) {
            Ok(CoordinationOutcome::NeedsConsensus(data)) => {
                let pending = PendingReply {
                    requester: origin.clone(),
                    in_reply_to: msg.message_id.clone(),
                    agent_id: msg.agent_id.clone(),
                    kind: msg.kind(),
                };
                match self.start_proposal(st, data, Some(pending), now, fx) {
                    // Still open: acknowledge now, the outcome follows on decision.
                    Ok((proposal_id, _)) if st.pending_replies.contains_key(&proposal_id) => {
                        ReplyStatus::Pending { proposal_id }
                    }
                    // Decided on the spot; `finalize` already answered.
                    Ok(_) => return,
                    Err(e) => ReplyStatus::Failed { error: e.to_string() },
                }
            }
            Ok(outcome) => {
                st.counters.coordination_applied += 1;
                self.announce_released(st, now, fx);
                outcome.reply_status().unwrap_or(ReplyStatus::Applied {
                    detail: "applied".into(),
                })
            }
            Err(e) => {
                st.counters.coordination_failed += 1;
                tracing::warn!(
                    message_id = %msg.message_id,
                    agent_id = %msg.agent_id,
                    source = %msg.source_node,
                    error = %e,
                    "Coordination message failed"
                );
                e.reply_status()
            }
        };
        let reply = reply_body(&self.inner.node_id, msg.message_id.clone(), msg.agent_id.clone(), msg.kind(), status);
        self.reply(st, origin, reply, now, fx);
    }

    fn handle_proposal(&self, st: &mut NodeState, params: &ProposalParams, now: DateTime<Utc>, fx: &mut Effects) {
        if let Err(e) = st.consensus.receive_proposal(params, now) {
            tracing::warn!(
                proposal_id = %params.proposal_id,
                proposer = %params.proposer,
                error = %e,
                "Ignoring proposal"
            );
            return;
        }
        let (approve, reason) = match &params.data {
            ProposalData::DeclareFaulty { peer } => {
                if peer == &self.inner.node_id {
                    (false, Some("refusing to declare self faulty".to_string()))
                } else if st.registry.is_connected(peer) {
                    (false, Some(format!("{peer} is healthy from here")))
                } else {
                    (true, None)
                }
            }
            data => st.coordinator.evaluate_proposal(data, now),
        };
        match st.consensus.cast_vote(&params.proposal_id, approve, reason) {
            Ok(vote) => {
                tracing::debug!(proposal_id = %params.proposal_id, approve, "Voting on proposal");
                let envelope = st
                    .router
                    .prepare_direct(params.proposer.clone(), MessageBody::Vote(vote));
                if let Err(e) = self.deliver(st, &envelope, now, fx) {
                    tracing::warn!(proposer = %params.proposer, error = %e, "Failed to send vote");
                }
            }
            Err(e) => tracing::warn!(proposal_id = %params.proposal_id, error = %e, "Cannot vote on proposal"),
        }
    }

    async fn heartbeat_tick(&self) {
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let now = Utc::now();
        let mut fx = Effects::default();
        let net = &self.inner.config.network;

        let interval = chrono::Duration::milliseconds(net.heartbeat_interval_ms as i64);
        let report = st
            .registry
            .sweep(now, interval, net.degraded_after_missed, net.closed_after_missed);
        for peer in &report.degraded {
            tracing::warn!(peer = %peer, missed = net.degraded_after_missed, "Peer degraded");
        }
        for peer in report.closed {
            st.router.forget_peer(&peer);
            st.counters.faults_detected += 1;
            tracing::warn!(peer = %peer, missed = net.closed_after_missed, "Peer closed after heartbeat timeout");
            fx.events.push(NetworkEvent::PeerDisconnected {
                peer: peer.clone(),
                reason: "heartbeat timeout".into(),
            });
            fx.events.push(NetworkEvent::FaultDetected {
                kind: FaultKind::HeartbeatTimeout,
                peer: Some(peer),
                detail: format!("silent for {} heartbeat intervals", net.closed_after_missed),
            });
        }

        let probe = HeartbeatParams {
            node_id: self.inner.node_id.clone(),
            sent_at: now,
            local_agents: st.coordinator.live_count(),
        };
        for peer in st.registry.live_peers() {
            if self.send_live(st, &peer, MessageBody::Heartbeat(probe.clone())) {
                st.counters.heartbeats_sent += 1;
            }
        }
        st.registry.prune_churn(now - self.inner.topology.churn_window);
        self.emit(guard, fx);
    }

    async fn consensus_tick(&self) {
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let now = Utc::now();
        let mut fx = Effects::default();
        for decision in st.consensus.expire(now) {
            tracing::warn!(proposal_id = %decision.proposal_id, role = ?decision.role, "Proposal timed out");
            self.finalize(st, decision, now, &mut fx);
        }
        st.consensus.prune(now);
        self.emit(guard, fx);
    }

    async fn health_tick(&self) {
        let mut guard = self.inner.state.write().await;
        let st = &mut *guard;
        let now = Utc::now();
        let mut fx = Effects::default();
        let health = compute_health(&self.health_inputs(st, now), &self.inner.topology, now);
        let changed = st
            .last_health
            .as_ref()
            .is_some_and(|previous| health.differs_materially(previous));
        if changed {
            tracing::info!(score = health.overall_score, alerts = health.active_alerts.len(), "Network health changed");
            fx.events.push(NetworkEvent::NetworkHealthChanged {
                health: health.clone(),
            });
        }
        if changed || st.last_health.is_none() {
            st.last_health = Some(health);
        }
        self.emit(guard, fx);
    }
}

fn reply_body(
    responder: &NodeId,
    in_reply_to: MessageId,
    agent_id: AgentId,
    kind: CoordinationKind,
    status: ReplyStatus,
) -> MessageBody {
    MessageBody::CoordinationReply(CoordinationReply {
        in_reply_to,
        agent_id,
        kind,
        responder: responder.clone(),
        status,
    })
}

fn decision_status(decision: &Decision) -> ReplyStatus {
    if decision.is_committed() {
        ReplyStatus::Applied {
            detail: format!("proposal {} committed", decision.proposal_id),
        }
    } else {
        ReplyStatus::Denied {
            reason: format!("proposal {} rejected ({:?})", decision.proposal_id, decision.reason),
        }
    }
}
