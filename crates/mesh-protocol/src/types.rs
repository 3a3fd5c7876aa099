use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{AgentId, NodeId};

/// Role of a node in the mesh. Every node is an equal peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    #[default]
    LeaderlessPeer,
}

/// Identity record of the local process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: NodeRole::LeaderlessPeer,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of a peer connection.
///
/// Valid moves: Connecting→Connected, Connecting→Closed, Connected→Degraded,
/// Degraded→Connected, Connected→Closed, Degraded→Closed. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Degraded)
                | (Connected, Closed)
                | (Degraded, Connected)
                | (Degraded, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Status of an agent hosted by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Pending,
    Active,
    Terminating,
    Terminated,
}

impl AgentStatus {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// Delivery priority attached to coordination messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// One dimension of a resource specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Cpu,
    Memory,
    Storage,
    Bandwidth,
    Gpu,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Bandwidth => "bandwidth",
            Self::Gpu => "gpu",
        };
        write!(f, "{s}")
    }
}

/// Resource amounts: cpu in cores, memory and storage in MiB, bandwidth in Mbit/s.
///
/// Used both for requests and for the node's capacity ceiling. For a
/// ceiling, `gpu_required` means a GPU is available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub storage: u64,
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub gpu_required: bool,
}

impl ResourceSpec {
    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Default::default()
        }
    }

    /// Reject values no node could ever satisfy or account for.
    pub fn validate(&self) -> Result<(), String> {
        if !self.cpu.is_finite() || self.cpu < 0.0 {
            return Err(format!("cpu must be a finite non-negative number, got {}", self.cpu));
        }
        Ok(())
    }

    /// First dimension in which `self` asks for more than `limit` offers.
    pub fn first_exceeding(&self, limit: &ResourceSpec) -> Option<ResourceDimension> {
        if self.cpu > limit.cpu {
            return Some(ResourceDimension::Cpu);
        }
        if self.memory > limit.memory {
            return Some(ResourceDimension::Memory);
        }
        if self.storage > limit.storage {
            return Some(ResourceDimension::Storage);
        }
        if self.bandwidth > limit.bandwidth {
            return Some(ResourceDimension::Bandwidth);
        }
        if self.gpu_required && !limit.gpu_required {
            return Some(ResourceDimension::Gpu);
        }
        None
    }

    pub fn fits_within(&self, limit: &ResourceSpec) -> bool {
        self.first_exceeding(limit).is_none()
    }

    pub fn plus(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            storage: self.storage.saturating_add(other.storage),
            bandwidth: self.bandwidth.saturating_add(other.bandwidth),
            gpu_required: self.gpu_required || other.gpu_required,
        }
    }

    /// Remaining capacity after `used` is taken out. GPUs are not shared.
    pub fn minus(&self, used: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu: (self.cpu - used.cpu).max(0.0),
            memory: self.memory.saturating_sub(used.memory),
            storage: self.storage.saturating_sub(used.storage),
            bandwidth: self.bandwidth.saturating_sub(used.bandwidth),
            gpu_required: self.gpu_required && !used.gpu_required,
        }
    }
}

/// Observed consumption reported through status updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub storage: u64,
    #[serde(default)]
    pub bandwidth: u64,
}

/// A task attached to an agent through TASK_ASSIGN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: String,
    pub payload: serde_json::Value,
    pub assigned_by: NodeId,
    pub assigned_at: DateTime<Utc>,
}

/// Authoritative record of an agent hosted by the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub owner_node: NodeId,
    /// 0..=100
    pub progress: u8,
    pub resource_usage: ResourceUsage,
    /// Resources reserved for this agent on its owner.
    pub requirements: ResourceSpec,
    #[serde(default)]
    pub tasks: Vec<AssignedTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the last applied status update (last-write-wins clock).
    #[serde(default)]
    pub last_status_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn new(
        id: AgentId,
        agent_type: String,
        owner_node: NodeId,
        requirements: ResourceSpec,
        status: AgentStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            agent_type,
            status,
            owner_node,
            progress: 0,
            resource_usage: ResourceUsage::default(),
            requirements,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
            last_status_at: None,
        }
    }
}

/// Description of an agent to register or spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub agent_type: String,
    #[serde(default)]
    pub requirements: ResourceSpec,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            requirements: ResourceSpec::default(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_requirements(mut self, requirements: ResourceSpec) -> Self {
        self.requirements = requirements;
        self
    }

    /// A spec with a blank id or type, or unusable requirements, is malformed.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_blank() {
            return Err("agent id must not be empty".into());
        }
        if self.agent_type.trim().is_empty() {
            return Err(format!("agent {} has an empty type", self.id));
        }
        self.requirements.validate()
    }
}

// ── Consensus data ──

/// The decision a proposal asks the electorate to agree on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposalData {
    /// Allow `target` to host a new agent.
    GrantSpawn {
        agent_id: AgentId,
        agent_type: String,
        target: NodeId,
        #[serde(default)]
        requirements: ResourceSpec,
    },
    /// Move ownership of an agent from one node to another.
    ReassignAgent {
        agent_id: AgentId,
        agent_type: String,
        from: NodeId,
        to: NodeId,
        #[serde(default)]
        requirements: ResourceSpec,
    },
    /// Declare a peer faulty for the whole mesh.
    DeclareFaulty { peer: NodeId },
}

impl ProposalData {
    /// Node that would end up hosting an agent if the proposal commits.
    pub fn host(&self) -> Option<&NodeId> {
        match self {
            Self::GrantSpawn { target, .. } => Some(target),
            Self::ReassignAgent { to, .. } => Some(to),
            Self::DeclareFaulty { .. } => None,
        }
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::GrantSpawn { agent_id, .. } | Self::ReassignAgent { agent_id, .. } => {
                Some(agent_id)
            }
            Self::DeclareFaulty { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::GrantSpawn { .. } => "grant_spawn",
            Self::ReassignAgent { .. } => "reassign_agent",
            Self::DeclareFaulty { .. } => "declare_faulty",
        }
    }
}

/// Outcome of a proposal. Committed and Rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalOutcome {
    Pending,
    Committed,
    Rejected,
}

impl ProposalOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ProposalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Why a proposal ended up Rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Enough no-votes that quorum became unreachable.
    QuorumNo,
    /// Not committed within the proposal window.
    Timeout,
    /// The proposing node shut down with the proposal in flight.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connected));
        assert!(Degraded.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connecting.can_transition_to(Degraded));
    }

    #[test]
    fn test_resource_ceiling_check() {
        let ceiling = ResourceSpec {
            cpu: 16.0,
            memory: 32_768,
            storage: 100_000,
            bandwidth: 1_000,
            gpu_required: false,
        };
        assert_eq!(
            ResourceSpec::cpu(1000.0).first_exceeding(&ceiling),
            Some(ResourceDimension::Cpu)
        );
        let gpu = ResourceSpec {
            gpu_required: true,
            ..Default::default()
        };
        assert_eq!(gpu.first_exceeding(&ceiling), Some(ResourceDimension::Gpu));
        assert!(ResourceSpec::cpu(2.0).fits_within(&ceiling));
    }

    #[test]
    fn test_resource_arithmetic() {
        let cap = ResourceSpec {
            cpu: 4.0,
            memory: 1024,
            ..Default::default()
        };
        let used = ResourceSpec {
            cpu: 1.5,
            memory: 2048,
            ..Default::default()
        };
        let left = cap.minus(&used);
        assert!((left.cpu - 2.5).abs() < 1e-9);
        assert_eq!(left.memory, 0);
        assert_eq!(used.plus(&used).memory, 4096);
    }

    #[test]
    fn test_agent_spec_validation() {
        assert!(AgentSpec::new("a1", "worker").validate().is_ok());
        assert!(AgentSpec::new("", "worker").validate().is_err());
        assert!(AgentSpec::new("a1", " ").validate().is_err());
        let bad = AgentSpec::new("a1", "worker").with_requirements(ResourceSpec::cpu(f64::NAN));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_proposal_data_tagging() {
        let data = ProposalData::GrantSpawn {
            agent_id: AgentId::new("a1"),
            agent_type: "worker".into(),
            target: NodeId::new("node-b"),
            requirements: ResourceSpec::default(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "grant_spawn");
        assert_eq!(data.host(), Some(&NodeId::new("node-b")));
    }
}
