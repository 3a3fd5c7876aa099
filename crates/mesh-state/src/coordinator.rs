//! Authoritative agent table for the local node.
//!
//! Every coordination message and every decided proposal that touches an
//! agent flows through [`AgentCoordinator`]. It owns three pieces of state:
//!
//! - the records of agents this node hosts (including `Terminated` tombstones)
//! - a directory of agents known to be hosted elsewhere, with the node that
//!   sponsored them
//! - the [`ResourceLedger`] backing every local reservation
//!
//! An agent has at most one owner. If a committed decision would give a
//! remote node an agent that is active here, the coordinator halts and
//! refuses agent-mutating work until [`AgentCoordinator::resync`] is called.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mesh_protocol::{
    AgentId, AgentRecord, AgentSpec, AgentStatus, AssignedTask, CoordinationKind,
    CoordinationMessage, CoordinationPayload, MessageId, NodeId, ProposalData, ReplyStatus,
    ResourceSpec, ResourceUsage, SeenWindow, DEFAULT_DEDUP_CAPACITY,
};

use crate::collaborators::{AgentLifecycle, AgentStore, CollaboratorError};
use crate::ledger::{ResourceDenial, ResourceLedger};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Hard ceiling for everything hosted on this node.
    pub capacity: ResourceSpec,
    pub max_agents: usize,
    /// Number of applied message ids remembered for dedup.
    pub dedup_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            capacity: ResourceSpec {
                cpu: 16.0,
                memory: 32_768,
                storage: 102_400,
                bandwidth: 1_000,
                gpu_required: false,
            },
            max_agents: 64,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// An agent hosted by another node, as learned from committed proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAgent {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub requirements: ResourceSpec,
    pub owner: NodeId,
    /// Node whose proposal placed the agent on `owner`.
    pub sponsor: NodeId,
    pub since: DateTime<Utc>,
}

/// Result of applying a coordination message.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationOutcome {
    Applied { detail: String },
    /// The message id was applied before; nothing changed. Carries the
    /// reply the first application produced, if it had one.
    Duplicate { first: Option<ReplyStatus> },
    Granted,
    Denied { reason: String },
    /// The message can only take effect through a committed proposal.
    NeedsConsensus(ProposalData),
}

impl CoordinationOutcome {
    /// Reply to the sender, unless a proposal still has to run.
    pub fn reply_status(&self) -> Option<ReplyStatus> {
        match self {
            Self::Applied { detail } => Some(ReplyStatus::Applied {
                detail: detail.clone(),
            }),
            Self::Duplicate { first } => Some(first.clone().unwrap_or(ReplyStatus::Applied {
                detail: "duplicate".into(),
            })),
            Self::Granted => Some(ReplyStatus::Granted),
            Self::Denied { reason } => Some(ReplyStatus::Denied {
                reason: reason.clone(),
            }),
            Self::NeedsConsensus(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Agent {agent_id} is {status:?}, not active")]
    AgentNotActive { agent_id: AgentId, status: AgentStatus },

    #[error("Agent {agent_id} is owned by {owner}")]
    OwnedElsewhere { agent_id: AgentId, owner: NodeId },

    #[error("Resources denied: {0}")]
    Resource(#[from] ResourceDenial),

    #[error("Invalid coordination message: {0}")]
    Invalid(String),

    #[error("Coordinator halted: {0}")]
    Halted(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl CoordinationError {
    pub fn reply_status(&self) -> ReplyStatus {
        match self {
            Self::Resource(denial) => ReplyStatus::Denied {
                reason: denial.to_string(),
            },
            other => ReplyStatus::Failed {
                error: other.to_string(),
            },
        }
    }
}

/// What `resync` repaired.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResyncReport {
    pub conflicts_cleared: usize,
    pub allocations_released: usize,
    pub allocations_restored: usize,
}

pub struct AgentCoordinator {
    local: NodeId,
    agents: HashMap<AgentId, AgentRecord>,
    remote: HashMap<AgentId, RemoteAgent>,
    ledger: ResourceLedger,
    /// Ids of messages applied successfully, with the reply each produced.
    applied: SeenWindow<MessageId>,
    replies: HashMap<MessageId, Option<ReplyStatus>>,
    /// Local agents terminated since the last `take_released`.
    released: Vec<AgentId>,
    lifecycle: Arc<dyn AgentLifecycle>,
    store: Arc<dyn AgentStore>,
    halted: Option<String>,
}

impl AgentCoordinator {
    pub fn new(
        local: NodeId,
        config: CoordinatorConfig,
        lifecycle: Arc<dyn AgentLifecycle>,
        store: Arc<dyn AgentStore>,
    ) -> Self {
        Self {
            local,
            agents: HashMap::new(),
            remote: HashMap::new(),
            ledger: ResourceLedger::new(config.capacity, config.max_agents),
            applied: SeenWindow::new(config.dedup_capacity),
            replies: HashMap::new(),
            released: Vec::new(),
            lifecycle,
            store,
            halted: None,
        }
    }

    /// Apply one coordination message. Each message id takes effect at most
    /// once; a redelivery gets the first reply back. Failed messages are not
    /// remembered, so a redelivery is evaluated again.
    pub fn apply(
        &mut self,
        msg: &CoordinationMessage,
        now: DateTime<Utc>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        if msg.agent_id.is_blank() || msg.source_node.is_blank() {
            return Err(CoordinationError::Invalid("empty agent or source id".into()));
        }
        if let Some(reason) = &self.halted {
            if msg.kind() != CoordinationKind::ResourceRequest {
                return Err(CoordinationError::Halted(reason.clone()));
            }
        }
        if self.applied.contains(&msg.message_id) {
            tracing::debug!(message_id = %msg.message_id, "Duplicate coordination message");
            return Ok(CoordinationOutcome::Duplicate {
                first: self.replies.get(&msg.message_id).cloned().flatten(),
            });
        }

        let outcome = self.apply_once(msg, now)?;
        if let Some(evicted) = self.applied.push(msg.message_id.clone()) {
            self.replies.remove(&evicted);
        }
        self.replies.insert(msg.message_id.clone(), outcome.reply_status());
        Ok(outcome)
    }

    fn apply_once(
        &mut self,
        msg: &CoordinationMessage,
        now: DateTime<Utc>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        tracing::debug!(
            message_id = %msg.message_id,
            kind = ?msg.kind(),
            agent_id = %msg.agent_id,
            source = %msg.source_node,
            priority = ?msg.priority,
            "Applying coordination message"
        );

        match &msg.payload {
            CoordinationPayload::Spawn {
                agent_type,
                requirements,
                config,
            } => {
                let spec = AgentSpec {
                    id: msg.agent_id.clone(),
                    agent_type: agent_type.clone(),
                    requirements: *requirements,
                    config: config.clone(),
                };
                self.spawn(spec, msg.target_node.as_ref(), now)
            }
            CoordinationPayload::Terminate { reason } => {
                self.terminate(&msg.agent_id, reason.as_deref(), now)
            }
            CoordinationPayload::TaskAssign { task_id, payload } => {
                let record = self.local_record_mut(&msg.agent_id)?;
                if record.status != AgentStatus::Active {
                    return Err(CoordinationError::AgentNotActive {
                        agent_id: msg.agent_id.clone(),
                        status: record.status,
                    });
                }
                if record.tasks.iter().any(|t| &t.task_id == task_id) {
                    return Ok(CoordinationOutcome::Applied {
                        detail: format!("task {task_id} already attached"),
                    });
                }
                record.tasks.push(AssignedTask {
                    task_id: task_id.clone(),
                    payload: payload.clone(),
                    assigned_by: msg.source_node.clone(),
                    assigned_at: msg.timestamp,
                });
                record.updated_at = now;
                let snapshot = record.clone();
                self.persist(&snapshot);
                Ok(CoordinationOutcome::Applied {
                    detail: format!("task {task_id} attached"),
                })
            }
            CoordinationPayload::StatusUpdate {
                progress,
                resource_usage,
            } => self.update_status(&msg.agent_id, *progress, *resource_usage, msg.timestamp, now),
            CoordinationPayload::ResourceRequest(request) => {
                Ok(match self.ledger.check(None, request) {
                    Ok(()) => CoordinationOutcome::Granted,
                    Err(denial) => {
                        tracing::debug!(agent_id = %msg.agent_id, reason = %denial, "Resource request denied");
                        CoordinationOutcome::Denied {
                            reason: denial.to_string(),
                        }
                    }
                })
            }
        }
    }

    fn spawn(
        &mut self,
        spec: AgentSpec,
        target: Option<&NodeId>,
        now: DateTime<Utc>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        spec.validate().map_err(CoordinationError::Invalid)?;
        let target = target.cloned().unwrap_or_else(|| self.local.clone());

        if let Some(owner) = self.owner_of(&spec.id) {
            if owner == target {
                return Ok(CoordinationOutcome::Applied {
                    detail: format!("agent {} already hosted by {owner}", spec.id),
                });
            }
            return Err(CoordinationError::OwnedElsewhere {
                agent_id: spec.id,
                owner,
            });
        }

        if target != self.local {
            return Ok(CoordinationOutcome::NeedsConsensus(ProposalData::GrantSpawn {
                agent_id: spec.id,
                agent_type: spec.agent_type,
                target,
                requirements: spec.requirements,
            }));
        }

        self.ledger.reserve(&spec.id, &spec.requirements)?;
        let record = AgentRecord::new(
            spec.id.clone(),
            spec.agent_type.clone(),
            self.local.clone(),
            spec.requirements,
            AgentStatus::Pending,
        );
        self.start(record, &spec.config, now)?;
        Ok(CoordinationOutcome::Applied {
            detail: format!("agent {} spawned", spec.id),
        })
    }

    /// Bring a reserved record to Active through the lifecycle collaborator.
    fn start(
        &mut self,
        mut record: AgentRecord,
        config: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        self.restore_persisted(&mut record);
        let spec = AgentSpec {
            id: record.id.clone(),
            agent_type: record.agent_type.clone(),
            requirements: record.requirements,
            config: config.clone(),
        };
        if let Err(e) = self.lifecycle.create(&spec) {
            tracing::warn!(agent_id = %record.id, error = %e, "Agent failed to start");
            self.ledger.release(&record.id);
            self.agents.remove(&record.id);
            return Err(e.into());
        }
        record.status = AgentStatus::Active;
        record.owner_node = self.local.clone();
        record.updated_at = now;
        tracing::info!(agent_id = %record.id, agent_type = %record.agent_type, "Agent active");
        self.persist(&record);
        self.agents.insert(record.id.clone(), record);
        Ok(())
    }

    fn terminate(
        &mut self,
        agent_id: &AgentId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        let Some(record) = self.agents.get_mut(agent_id) else {
            if let Some(remote) = self.remote.get(agent_id) {
                return Err(CoordinationError::OwnedElsewhere {
                    agent_id: agent_id.clone(),
                    owner: remote.owner.clone(),
                });
            }
            return Ok(CoordinationOutcome::Applied {
                detail: format!("agent {agent_id} not present"),
            });
        };
        if record.status == AgentStatus::Terminated {
            return Ok(CoordinationOutcome::Applied {
                detail: format!("agent {agent_id} already terminated"),
            });
        }
        record.status = AgentStatus::Terminating;
        record.updated_at = now;
        if let Err(e) = self.lifecycle.destroy(agent_id) {
            tracing::warn!(agent_id = %agent_id, error = %e, "Lifecycle destroy failed");
        }
        self.ledger.release(agent_id);
        record.status = AgentStatus::Terminated;
        let snapshot = record.clone();
        tracing::info!(agent_id = %agent_id, reason = reason.unwrap_or("requested"), "Agent terminated");
        self.persist(&snapshot);
        self.released.push(agent_id.clone());
        Ok(CoordinationOutcome::Applied {
            detail: format!("agent {agent_id} terminated"),
        })
    }

    fn update_status(
        &mut self,
        agent_id: &AgentId,
        progress: Option<u8>,
        usage: Option<ResourceUsage>,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        let record = self.local_record_mut(agent_id)?;
        if !record.status.is_live() {
            return Err(CoordinationError::AgentNotActive {
                agent_id: agent_id.clone(),
                status: record.status,
            });
        }
        // Last writer wins by sender timestamp; ties keep the first.
        if record.last_status_at.is_some_and(|last| last >= sent_at) {
            return Ok(CoordinationOutcome::Applied {
                detail: "stale status update ignored".into(),
            });
        }
        if let Some(p) = progress {
            record.progress = p.min(100);
        }
        if let Some(u) = usage {
            record.resource_usage = u;
        }
        record.last_status_at = Some(sent_at);
        record.updated_at = now;
        let snapshot = record.clone();
        self.persist(&snapshot);
        Ok(CoordinationOutcome::Applied {
            detail: "status updated".into(),
        })
    }

    /// Decide this node's vote on a proposal.
    ///
    /// The host of a spawn or reassignment approves only if it can reserve
    /// the resources, and keeps a `Pending` record holding the reservation
    /// until the decision arrives. Other nodes approve unless they know the
    /// agent to be owned by someone else.
    pub fn evaluate_proposal(&mut self, data: &ProposalData, now: DateTime<Utc>) -> (bool, Option<String>) {
        if let Some(reason) = &self.halted {
            return (false, Some(format!("coordinator halted: {reason}")));
        }
        match data {
            ProposalData::GrantSpawn {
                agent_id,
                agent_type,
                target,
                requirements,
            } => {
                if let Some(owner) = self.owner_of(agent_id) {
                    if &owner != target {
                        return (false, Some(format!("agent {agent_id} is owned by {owner}")));
                    }
                    if owner != self.local {
                        return (true, None);
                    }
                }
                if target == &self.local {
                    self.reserve_pending(agent_id, agent_type, requirements, now)
                } else {
                    (true, None)
                }
            }
            ProposalData::ReassignAgent {
                agent_id,
                agent_type,
                from,
                to,
                requirements,
            } => {
                if let Some(owner) = self.owner_of(agent_id) {
                    if &owner != from {
                        return (false, Some(format!("agent {agent_id} is owned by {owner}, not {from}")));
                    }
                }
                if from == &self.local && !self.is_active(agent_id) {
                    return (false, Some(format!("agent {agent_id} is not active here")));
                }
                if to == &self.local {
                    self.reserve_pending(agent_id, agent_type, requirements, now)
                } else {
                    (true, None)
                }
            }
            ProposalData::DeclareFaulty { peer } => {
                if peer == &self.local {
                    (false, Some("refusing to declare self faulty".into()))
                } else {
                    (true, None)
                }
            }
        }
    }

    fn reserve_pending(
        &mut self,
        agent_id: &AgentId,
        agent_type: &str,
        requirements: &ResourceSpec,
        now: DateTime<Utc>,
    ) -> (bool, Option<String>) {
        if let Err(denial) = self.ledger.reserve(agent_id, requirements) {
            tracing::debug!(agent_id = %agent_id, reason = %denial, "Cannot host agent");
            return (false, Some(denial.to_string()));
        }
        let live = self.agents.get(agent_id).is_some_and(|r| r.status.is_live());
        if !live {
            let mut record = AgentRecord::new(
                agent_id.clone(),
                agent_type.to_string(),
                self.local.clone(),
                *requirements,
                AgentStatus::Pending,
            );
            record.created_at = now;
            record.updated_at = now;
            self.agents.insert(agent_id.clone(), record);
        }
        (true, None)
    }

    /// Apply a decided proposal. `proposer` is recorded as the sponsor of
    /// any agent placed on a remote node.
    pub fn apply_decision(
        &mut self,
        proposer: &NodeId,
        data: &ProposalData,
        committed: bool,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        match data {
            ProposalData::GrantSpawn {
                agent_id,
                agent_type,
                target,
                requirements,
            } => {
                if !committed {
                    if target == &self.local {
                        self.drop_pending(agent_id);
                    }
                    return Ok(());
                }
                if target == &self.local {
                    self.host_committed(agent_id, agent_type, requirements, now)
                } else {
                    self.record_remote(agent_id, agent_type, requirements, target, proposer, now)
                }
            }
            ProposalData::ReassignAgent {
                agent_id,
                agent_type,
                from,
                to,
                requirements,
            } => {
                if !committed {
                    if to == &self.local {
                        self.drop_pending(agent_id);
                    }
                    return Ok(());
                }
                if from == &self.local {
                    self.hand_off(agent_id, to);
                }
                if to == &self.local {
                    self.remote.remove(agent_id);
                    self.host_committed(agent_id, agent_type, requirements, now)
                } else {
                    self.record_remote(agent_id, agent_type, requirements, to, proposer, now)
                }
            }
            ProposalData::DeclareFaulty { peer } => {
                if committed {
                    let hosted = self.agents_hosted_by(peer);
                    tracing::warn!(
                        peer = %peer,
                        agents = hosted.len(),
                        "Peer declared faulty; its agents stay assigned until reassigned"
                    );
                }
                Ok(())
            }
        }
    }

    fn host_committed(
        &mut self,
        agent_id: &AgentId,
        agent_type: &str,
        requirements: &ResourceSpec,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        let status = self.agents.get(agent_id).map(|r| r.status);
        let record = match status {
            Some(AgentStatus::Active) => return Ok(()),
            Some(AgentStatus::Pending) => match self.agents.remove(agent_id) {
                Some(record) => record,
                None => return Err(CoordinationError::UnknownAgent(agent_id.clone())),
            },
            _ => {
                // Committed without our reservation (we voted no or missed the proposal).
                if let Err(denial) = self.ledger.reserve(agent_id, requirements) {
                    let reason = format!("committed to host agent {agent_id} but cannot reserve: {denial}");
                    tracing::error!(agent_id = %agent_id, reason = %denial, "Ownership invariant violated, halting coordinator");
                    self.halted = Some(reason.clone());
                    return Err(CoordinationError::Halted(reason));
                }
                AgentRecord::new(
                    agent_id.clone(),
                    agent_type.to_string(),
                    self.local.clone(),
                    *requirements,
                    AgentStatus::Pending,
                )
            }
        };
        self.start(record, &serde_json::Value::Null, now)
    }

    fn record_remote(
        &mut self,
        agent_id: &AgentId,
        agent_type: &str,
        requirements: &ResourceSpec,
        owner: &NodeId,
        sponsor: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        match self.agents.get(agent_id).map(|r| r.status) {
            Some(AgentStatus::Active) => {
                let reason = format!("agent {agent_id} committed to {owner} while active on this node");
                tracing::error!(agent_id = %agent_id, owner = %owner, "Ownership invariant violated, halting coordinator");
                self.halted = Some(reason.clone());
                return Err(CoordinationError::Halted(reason));
            }
            Some(AgentStatus::Pending) => self.drop_pending(agent_id),
            _ => {}
        }
        self.remote.insert(
            agent_id.clone(),
            RemoteAgent {
                agent_id: agent_id.clone(),
                agent_type: agent_type.to_string(),
                requirements: *requirements,
                owner: owner.clone(),
                sponsor: sponsor.clone(),
                since: now,
            },
        );
        tracing::debug!(agent_id = %agent_id, owner = %owner, sponsor = %sponsor, "Recorded remote agent");
        Ok(())
    }

    /// Give up a local agent that moved to `to`. The record is persisted
    /// before removal so its state can follow the agent.
    fn hand_off(&mut self, agent_id: &AgentId, to: &NodeId) {
        let Some(record) = self.agents.remove(agent_id) else {
            return;
        };
        self.persist(&record);
        if let Err(e) = self.lifecycle.destroy(agent_id) {
            tracing::warn!(agent_id = %agent_id, error = %e, "Lifecycle destroy failed during hand-off");
        }
        self.ledger.release(agent_id);
        tracing::info!(agent_id = %agent_id, to = %to, "Agent handed off");
    }

    fn drop_pending(&mut self, agent_id: &AgentId) {
        if self
            .agents
            .get(agent_id)
            .is_some_and(|r| r.status == AgentStatus::Pending)
        {
            self.agents.remove(agent_id);
            self.ledger.release(agent_id);
            tracing::debug!(agent_id = %agent_id, "Released pending reservation");
        }
    }

    /// Carry progress and tasks over from a previously persisted record.
    fn restore_persisted(&self, record: &mut AgentRecord) {
        match self.store.load(&record.id) {
            Ok(Some(state)) => match serde_json::from_value::<AgentRecord>(state) {
                Ok(previous) => {
                    record.progress = previous.progress;
                    record.tasks = previous.tasks;
                    record.last_status_at = previous.last_status_at;
                }
                Err(e) => tracing::warn!(agent_id = %record.id, error = %e, "Ignoring unreadable agent state"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(agent_id = %record.id, error = %e, "Failed to load agent state"),
        }
    }

    fn persist(&self, record: &AgentRecord) {
        let result = serde_json::to_value(record)
            .map_err(|e| CollaboratorError::Store(e.to_string()))
            .and_then(|state| self.store.save(&record.id, &state));
        if let Err(e) = result {
            tracing::warn!(agent_id = %record.id, error = %e, "Failed to persist agent state");
        }
    }

    /// Fails unless `agent_id` has a record on this node.
    fn ensure_local(&self, agent_id: &AgentId) -> Result<(), CoordinationError> {
        if self.agents.contains_key(agent_id) {
            return Ok(());
        }
        Err(match self.remote.get(agent_id) {
            Some(remote) => CoordinationError::OwnedElsewhere {
                agent_id: agent_id.clone(),
                owner: remote.owner.clone(),
            },
            None => CoordinationError::UnknownAgent(agent_id.clone()),
        })
    }

    fn local_record_mut(&mut self, agent_id: &AgentId) -> Result<&mut AgentRecord, CoordinationError> {
        self.ensure_local(agent_id)?;
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::UnknownAgent(agent_id.clone()))
    }

    /// Current owner of an agent. A local reservation still pending a
    /// decision does not override a known remote owner.
    pub fn owner_of(&self, agent_id: &AgentId) -> Option<NodeId> {
        let local = self.agents.get(agent_id).map(|r| r.status);
        if local == Some(AgentStatus::Active) {
            return Some(self.local.clone());
        }
        if let Some(remote) = self.remote.get(agent_id) {
            return Some(remote.owner.clone());
        }
        (local == Some(AgentStatus::Pending)).then(|| self.local.clone())
    }

    /// Recover from a halt. Local active agents win over conflicting
    /// directory entries, and ledger reservations are rebuilt from the
    /// live records.
    pub fn resync(&mut self) -> ResyncReport {
        let mut report = ResyncReport::default();

        let conflicts: Vec<AgentId> = self
            .remote
            .keys()
            .filter(|id| {
                self.agents
                    .get(*id)
                    .is_some_and(|r| r.status == AgentStatus::Active)
            })
            .cloned()
            .collect();
        for id in conflicts {
            self.remote.remove(&id);
            report.conflicts_cleared += 1;
        }

        let stale: Vec<AgentId> = self
            .ledger
            .reserved_agents()
            .filter(|id| !self.agents.get(*id).is_some_and(|r| r.status.is_live()))
            .cloned()
            .collect();
        for id in stale {
            self.ledger.release(&id);
            report.allocations_released += 1;
        }

        for record in self.agents.values().filter(|r| r.status.is_live()) {
            if self.ledger.is_reserved(&record.id) {
                continue;
            }
            match self.ledger.reserve(&record.id, &record.requirements) {
                Ok(()) => report.allocations_restored += 1,
                Err(e) => tracing::warn!(agent_id = %record.id, error = %e, "Could not restore reservation"),
            }
        }

        if let Some(reason) = self.halted.take() {
            tracing::info!(reason = %reason, "Coordinator resumed");
        }
        tracing::info!(
            conflicts = report.conflicts_cleared,
            released = report.allocations_released,
            restored = report.allocations_restored,
            "Coordinator resynced"
        );
        report
    }

    /// Terminate every live local agent. Used on shutdown.
    pub fn terminate_all(&mut self, now: DateTime<Utc>) -> Vec<AgentId> {
        let mut live: Vec<AgentId> = self
            .agents
            .values()
            .filter(|r| r.status.is_live())
            .map(|r| r.id.clone())
            .collect();
        live.sort();
        for id in &live {
            if let Err(e) = self.terminate(id, Some("shutdown"), now) {
                tracing::warn!(agent_id = %id, error = %e, "Failed to terminate agent on shutdown");
            }
        }
        live
    }

    /// Local agents terminated since the previous call. Their owner is
    /// expected to announce the release to the mesh.
    pub fn take_released(&mut self) -> Vec<AgentId> {
        std::mem::take(&mut self.released)
    }

    /// Drop a directory entry after `owner` announced the agent gone.
    /// Entries naming a different owner are kept.
    pub fn forget_remote(&mut self, agent_id: &AgentId, owner: &NodeId) -> bool {
        if self.remote.get(agent_id).is_some_and(|r| &r.owner == owner) {
            self.remote.remove(agent_id);
            tracing::debug!(agent_id = %agent_id, owner = %owner, "Forgot released remote agent");
            return true;
        }
        false
    }

    /// Peers hosting active agents that this node sponsored.
    pub fn pinned_peers(&self) -> HashMap<NodeId, Vec<AgentId>> {
        let mut pinned: HashMap<NodeId, Vec<AgentId>> = HashMap::new();
        for remote in self.remote.values().filter(|r| r.sponsor == self.local) {
            pinned
                .entry(remote.owner.clone())
                .or_default()
                .push(remote.agent_id.clone());
        }
        for agents in pinned.values_mut() {
            agents.sort();
        }
        pinned
    }

    pub fn agents_hosted_by(&self, node: &NodeId) -> Vec<AgentId> {
        let mut hosted: Vec<AgentId> = self
            .remote
            .values()
            .filter(|r| &r.owner == node)
            .map(|r| r.agent_id.clone())
            .collect();
        hosted.sort();
        hosted
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(agent_id)
    }

    pub fn is_active(&self, agent_id: &AgentId) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|r| r.status == AgentStatus::Active)
    }

    /// Live local agents, ordered by id.
    pub fn local_agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .agents
            .values()
            .filter(|r| r.status.is_live())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn live_count(&self) -> usize {
        self.agents.values().filter(|r| r.status.is_live()).count()
    }

    pub fn remote_agent(&self, agent_id: &AgentId) -> Option<&RemoteAgent> {
        self.remote.get(agent_id)
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AgentHandle, InMemoryLifecycle, InMemoryStore};

    fn coordinator(id: &str) -> (AgentCoordinator, Arc<InMemoryLifecycle>) {
        let lifecycle = Arc::new(InMemoryLifecycle::new());
        let c = AgentCoordinator::new(
            NodeId::new(id),
            CoordinatorConfig::default(),
            lifecycle.clone(),
            Arc::new(InMemoryStore::new()),
        );
        (c, lifecycle)
    }

    fn spawn_msg(agent: &str, cpu: f64) -> CoordinationMessage {
        CoordinationMessage::spawn(NodeId::new("client"), AgentId::new(agent), "worker", ResourceSpec::cpu(cpu))
    }

    #[test]
    fn test_local_spawn_activates_and_reserves() {
        let (mut c, lc) = coordinator("node-a");
        let out = c.apply(&spawn_msg("a1", 2.0), Utc::now()).unwrap();
        assert!(matches!(out, CoordinationOutcome::Applied { .. }));
        let id = AgentId::new("a1");
        assert!(c.is_active(&id));
        assert!(lc.is_running(&id));
        assert_eq!(c.ledger().allocated().cpu, 2.0);
    }

    #[test]
    fn test_spawn_is_idempotent_by_message_and_agent() {
        let (mut c, _) = coordinator("node-a");
        let msg = spawn_msg("a1", 2.0);
        c.apply(&msg, Utc::now()).unwrap();
        match c.apply(&msg, Utc::now()).unwrap() {
            CoordinationOutcome::Duplicate { first: Some(ReplyStatus::Applied { detail }) } => {
                assert!(detail.contains("spawned"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // A fresh message for the same agent is a no-op too.
        c.apply(&spawn_msg("a1", 2.0), Utc::now()).unwrap();
        assert_eq!(c.live_count(), 1);
        assert_eq!(c.ledger().allocated().cpu, 2.0);
    }

    #[test]
    fn test_remote_target_needs_consensus() {
        let (mut c, _) = coordinator("node-a");
        let msg = spawn_msg("a1", 1.0).targeting(NodeId::new("node-b"));
        match c.apply(&msg, Utc::now()).unwrap() {
            CoordinationOutcome::NeedsConsensus(ProposalData::GrantSpawn { target, .. }) => {
                assert_eq!(target, NodeId::new("node-b"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(c.live_count(), 0);
    }

    #[test]
    fn test_terminate_is_idempotent_and_releases() {
        let (mut c, lc) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 4.0), Utc::now()).unwrap();
        let id = AgentId::new("a1");
        let term = CoordinationMessage::terminate(NodeId::new("client"), id.clone());
        c.apply(&term, Utc::now()).unwrap();
        assert_eq!(c.get(&id).unwrap().status, AgentStatus::Terminated);
        assert!(!lc.is_running(&id));
        assert_eq!(c.ledger().allocated().cpu, 0.0);
        let again = CoordinationMessage::terminate(NodeId::new("client"), id.clone());
        assert!(matches!(c.apply(&again, Utc::now()).unwrap(), CoordinationOutcome::Applied { .. }));
    }

    #[test]
    fn test_terminate_of_absent_agent_is_noop() {
        let (mut c, _) = coordinator("node-a");
        let term = CoordinationMessage::terminate(NodeId::new("client"), AgentId::new("never-existed"));
        match c.apply(&term, Utc::now()).unwrap() {
            CoordinationOutcome::Applied { detail } => assert!(detail.contains("not present")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(c.take_released().is_empty());

        // Agents known to live elsewhere are not ours to terminate.
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("far"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();
        let term = CoordinationMessage::terminate(NodeId::new("client"), AgentId::new("far"));
        assert!(matches!(
            c.apply(&term, Utc::now()),
            Err(CoordinationError::OwnedElsewhere { .. })
        ));
    }

    #[test]
    fn test_failed_message_is_evaluated_again_on_redelivery() {
        let (mut c, _) = coordinator("node-a");
        let msg = spawn_msg("huge", 1000.0);
        for _ in 0..2 {
            assert!(matches!(
                c.apply(&msg, Utc::now()),
                Err(CoordinationError::Resource(_))
            ));
        }

        let ask = CoordinationMessage::new(
            NodeId::new("client"),
            AgentId::new("a1"),
            CoordinationPayload::ResourceRequest(ResourceSpec::cpu(1000.0)),
        );
        assert!(matches!(c.apply(&ask, Utc::now()).unwrap(), CoordinationOutcome::Denied { .. }));
        let again = c.apply(&ask, Utc::now()).unwrap();
        assert!(matches!(again.reply_status(), Some(ReplyStatus::Denied { .. })));
    }

    #[test]
    fn test_terminations_are_reported_once() {
        let (mut c, _) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap();
        let term = CoordinationMessage::terminate(NodeId::new("client"), AgentId::new("a1"));
        c.apply(&term, Utc::now()).unwrap();
        assert_eq!(c.take_released(), vec![AgentId::new("a1")]);
        assert!(c.take_released().is_empty());
    }

    #[test]
    fn test_released_remote_agent_leaves_directory() {
        let (mut c, _) = coordinator("node-a");
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();

        assert!(!c.forget_remote(&AgentId::new("a1"), &NodeId::new("node-c")));
        assert_eq!(c.owner_of(&AgentId::new("a1")), Some(NodeId::new("node-b")));

        assert!(c.forget_remote(&AgentId::new("a1"), &NodeId::new("node-b")));
        assert_eq!(c.owner_of(&AgentId::new("a1")), None);
        assert!(c.pinned_peers().is_empty());
        assert!(c.apply(&spawn_msg("a1", 1.0), Utc::now()).is_ok());
        assert!(c.is_active(&AgentId::new("a1")));
    }

    #[test]
    fn test_reassign_from_here_needs_active_agent() {
        let (mut c, _) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap();
        let term = CoordinationMessage::terminate(NodeId::new("client"), AgentId::new("a1"));
        c.apply(&term, Utc::now()).unwrap();

        let data = ProposalData::ReassignAgent {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            from: NodeId::new("node-a"),
            to: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        let (approve, reason) = c.evaluate_proposal(&data, Utc::now());
        assert!(!approve);
        assert!(reason.unwrap().contains("not active"));
    }

    #[test]
    fn test_commit_beyond_capacity_halts() {
        let (mut c, _) = coordinator("node-b");
        c.apply(&spawn_msg("local", 12.0), Utc::now()).unwrap();
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(8.0),
        };
        // Voted no for lack of capacity, yet the mesh committed.
        assert!(!c.evaluate_proposal(&data, Utc::now()).0);
        let err = c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap_err();
        assert!(matches!(err, CoordinationError::Halted(_)));
        assert!(c.is_halted());
        assert!(c.get(&AgentId::new("a1")).is_none());
    }

    #[test]
    fn test_task_assign_requires_active_agent() {
        let (mut c, _) = coordinator("node-a");
        let msg = CoordinationMessage::new(
            NodeId::new("client"),
            AgentId::new("ghost"),
            CoordinationPayload::TaskAssign {
                task_id: "t1".into(),
                payload: serde_json::json!({"q": 1}),
            },
        );
        let err = c.apply(&msg, Utc::now()).unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownAgent(_)));
        assert!(matches!(err.reply_status(), ReplyStatus::Failed { .. }));
    }

    #[test]
    fn test_status_update_last_write_wins() {
        let (mut c, _) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap();
        let id = AgentId::new("a1");
        let t0 = Utc::now();
        let update = |progress: u8, at| {
            CoordinationMessage::new(
                NodeId::new("client"),
                AgentId::new("a1"),
                CoordinationPayload::StatusUpdate {
                    progress: Some(progress),
                    resource_usage: None,
                },
            )
            .at(at)
        };
        c.apply(&update(60, t0 + chrono::Duration::seconds(2)), Utc::now()).unwrap();
        c.apply(&update(30, t0 + chrono::Duration::seconds(1)), Utc::now()).unwrap();
        assert_eq!(c.get(&id).unwrap().progress, 60);
        c.apply(&update(250, t0 + chrono::Duration::seconds(3)), Utc::now()).unwrap();
        assert_eq!(c.get(&id).unwrap().progress, 100);
    }

    #[test]
    fn test_resource_request_over_ceiling_denied() {
        let (mut c, _) = coordinator("node-a");
        let msg = CoordinationMessage::new(
            NodeId::new("client"),
            AgentId::new("a1"),
            CoordinationPayload::ResourceRequest(ResourceSpec::cpu(1000.0)),
        );
        match c.apply(&msg, Utc::now()).unwrap() {
            CoordinationOutcome::Denied { reason } => assert!(reason.contains("cpu")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_host_votes_on_capacity_and_holds_reservation() {
        let (mut c, _) = coordinator("node-b");
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(8.0),
        };
        assert_eq!(c.evaluate_proposal(&data, Utc::now()), (true, None));
        assert_eq!(c.get(&AgentId::new("a1")).unwrap().status, AgentStatus::Pending);

        let big = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a2"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(10.0),
        };
        let (approve, reason) = c.evaluate_proposal(&big, Utc::now());
        assert!(!approve);
        assert!(reason.is_some());

        c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();
        assert!(c.is_active(&AgentId::new("a1")));
    }

    #[test]
    fn test_rejected_grant_releases_pending() {
        let (mut c, _) = coordinator("node-b");
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(8.0),
        };
        c.evaluate_proposal(&data, Utc::now());
        c.apply_decision(&NodeId::new("node-a"), &data, false, Utc::now()).unwrap();
        assert!(c.get(&AgentId::new("a1")).is_none());
        assert!(c.ledger().is_empty());
    }

    #[test]
    fn test_sponsored_remote_agents_pin_their_host() {
        let (mut c, _) = coordinator("node-a");
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();
        let pinned = c.pinned_peers();
        assert_eq!(pinned[&NodeId::new("node-b")], vec![AgentId::new("a1")]);
        assert_eq!(c.owner_of(&AgentId::new("a1")), Some(NodeId::new("node-b")));
    }

    #[test]
    fn test_double_owner_halts_until_resync() {
        let (mut c, _) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap();
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        let err = c.apply_decision(&NodeId::new("node-c"), &data, true, Utc::now()).unwrap_err();
        assert!(matches!(err, CoordinationError::Halted(_)));
        assert!(c.is_halted());
        assert!(matches!(
            c.apply(&spawn_msg("a2", 1.0), Utc::now()),
            Err(CoordinationError::Halted(_))
        ));

        let report = c.resync();
        assert!(!c.is_halted());
        assert_eq!(report.allocations_released, 0);
        assert!(c.apply(&spawn_msg("a2", 1.0), Utc::now()).is_ok());
    }

    #[test]
    fn test_reassign_hands_off_local_agent() {
        let (mut c, lc) = coordinator("node-a");
        c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap();
        let data = ProposalData::ReassignAgent {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            from: NodeId::new("node-a"),
            to: NodeId::new("node-b"),
            requirements: ResourceSpec::cpu(1.0),
        };
        assert_eq!(c.evaluate_proposal(&data, Utc::now()), (true, None));
        c.apply_decision(&NodeId::new("node-a"), &data, true, Utc::now()).unwrap();
        assert!(!lc.is_running(&AgentId::new("a1")));
        assert!(c.ledger().is_empty());
        assert_eq!(c.owner_of(&AgentId::new("a1")), Some(NodeId::new("node-b")));
    }

    struct FailingLifecycle;

    impl AgentLifecycle for FailingLifecycle {
        fn create(&self, _spec: &AgentSpec) -> Result<AgentHandle, CollaboratorError> {
            Err(CollaboratorError::Lifecycle("no runtime".into()))
        }

        fn destroy(&self, _agent_id: &AgentId) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_start_releases_reservation() {
        let mut c = AgentCoordinator::new(
            NodeId::new("node-a"),
            CoordinatorConfig::default(),
            Arc::new(FailingLifecycle),
            Arc::new(InMemoryStore::new()),
        );
        let err = c.apply(&spawn_msg("a1", 1.0), Utc::now()).unwrap_err();
        assert!(matches!(err, CoordinationError::Collaborator(_)));
        assert!(c.ledger().is_empty());
        assert_eq!(c.live_count(), 0);
    }
}
