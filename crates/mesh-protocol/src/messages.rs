use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FRAME_BYTES, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::identity::{AgentId, MessageId, NodeId, ProposalId};
use crate::types::*;

/// Top-level wire envelope. Every frame on a transport channel is one
/// JSON-encoded envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub origin: NodeId,
    /// Set for single-peer delivery. Targeted envelopes are never forwarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    /// Remaining hop budget. Envelopes arriving with ttl 0 are dropped.
    pub ttl: u32,
    /// Number of times this envelope has been forwarded.
    pub hop: u32,
    pub sent_at: DateTime<Utc>,
    pub body: MessageBody,
}

impl Envelope {
    /// Envelope meant to be flooded through the mesh.
    pub fn broadcast(origin: NodeId, ttl: u32, body: MessageBody) -> Self {
        Self {
            message_id: MessageId::generate(),
            origin,
            target: None,
            ttl,
            hop: 0,
            sent_at: Utc::now(),
            body,
        }
    }

    /// Envelope for exactly one directly connected peer.
    pub fn direct(origin: NodeId, target: NodeId, body: MessageBody) -> Self {
        Self {
            message_id: MessageId::generate(),
            origin,
            target: Some(target),
            ttl: 1,
            hop: 0,
            sent_at: Utc::now(),
            body,
        }
    }

    pub fn method(&self) -> ProtocolMethod {
        self.body.method()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let data = serde_json::to_vec(self)?;
        if data.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        Ok(Bytes::from(data))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        let envelope: Envelope = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if envelope.message_id.is_blank() {
            return Err(ProtocolError::Malformed("empty message_id".into()));
        }
        if envelope.origin.is_blank() {
            return Err(ProtocolError::Malformed("empty origin".into()));
        }
        Ok(envelope)
    }
}

/// Envelope body, tagged by protocol method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum MessageBody {
    #[serde(rename = "mesh.heartbeat")]
    Heartbeat(HeartbeatParams),
    #[serde(rename = "mesh.heartbeat_ack")]
    HeartbeatAck(HeartbeatParams),
    #[serde(rename = "mesh.goodbye")]
    Goodbye(GoodbyeParams),
    #[serde(rename = "coordination.message")]
    Coordination(CoordinationMessage),
    #[serde(rename = "coordination.reply")]
    CoordinationReply(CoordinationReply),
    #[serde(rename = "coordination.released")]
    AgentReleased(AgentReleased),
    #[serde(rename = "consensus.propose")]
    Proposal(ProposalParams),
    #[serde(rename = "consensus.vote")]
    Vote(VoteParams),
    #[serde(rename = "consensus.commit")]
    Commit(CommitParams),
    #[serde(rename = "app.message")]
    Application(serde_json::Value),
}

impl MessageBody {
    pub fn method(&self) -> ProtocolMethod {
        match self {
            Self::Heartbeat(_) => ProtocolMethod::Heartbeat,
            Self::HeartbeatAck(_) => ProtocolMethod::HeartbeatAck,
            Self::Goodbye(_) => ProtocolMethod::Goodbye,
            Self::Coordination(_) => ProtocolMethod::Coordination,
            Self::CoordinationReply(_) => ProtocolMethod::CoordinationReply,
            Self::AgentReleased(_) => ProtocolMethod::AgentReleased,
            Self::Proposal(_) => ProtocolMethod::Proposal,
            Self::Vote(_) => ProtocolMethod::Vote,
            Self::Commit(_) => ProtocolMethod::Commit,
            Self::Application(_) => ProtocolMethod::Application,
        }
    }
}

/// Enumeration of all protocol methods for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMethod {
    Heartbeat,
    HeartbeatAck,
    Goodbye,
    Coordination,
    CoordinationReply,
    AgentReleased,
    Proposal,
    Vote,
    Commit,
    Application,
}

impl ProtocolMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "mesh.heartbeat",
            Self::HeartbeatAck => "mesh.heartbeat_ack",
            Self::Goodbye => "mesh.goodbye",
            Self::Coordination => "coordination.message",
            Self::CoordinationReply => "coordination.reply",
            Self::AgentReleased => "coordination.released",
            Self::Proposal => "consensus.propose",
            Self::Vote => "consensus.vote",
            Self::Commit => "consensus.commit",
            Self::Application => "app.message",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mesh.heartbeat" => Some(Self::Heartbeat),
            "mesh.heartbeat_ack" => Some(Self::HeartbeatAck),
            "mesh.goodbye" => Some(Self::Goodbye),
            "coordination.message" => Some(Self::Coordination),
            "coordination.reply" => Some(Self::CoordinationReply),
            "coordination.released" => Some(Self::AgentReleased),
            "consensus.propose" => Some(Self::Proposal),
            "consensus.vote" => Some(Self::Vote),
            "consensus.commit" => Some(Self::Commit),
            "app.message" => Some(Self::Application),
            _ => None,
        }
    }

    /// Consensus traffic is handled by the consensus engine.
    pub fn is_consensus(&self) -> bool {
        matches!(self, Self::Proposal | Self::Vote | Self::Commit)
    }
}

// ── Liveness ──

/// Heartbeat probe. The ack echoes `sent_at` so the prober can estimate RTT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub node_id: NodeId,
    pub sent_at: DateTime<Utc>,
    pub local_agents: usize,
}

/// Sent before an orderly disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodbyeParams {
    pub node_id: NodeId,
    pub reason: String,
}

// ── Coordination ──

/// Kind of a coordination message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationKind {
    Spawn,
    Terminate,
    TaskAssign,
    StatusUpdate,
    ResourceRequest,
}

/// Typed payload of a coordination message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationPayload {
    Spawn {
        agent_type: String,
        #[serde(default)]
        requirements: ResourceSpec,
        #[serde(default)]
        config: serde_json::Value,
    },
    Terminate {
        #[serde(default)]
        reason: Option<String>,
    },
    TaskAssign {
        task_id: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    StatusUpdate {
        #[serde(default)]
        progress: Option<u8>,
        #[serde(default)]
        resource_usage: Option<ResourceUsage>,
    },
    ResourceRequest(ResourceSpec),
}

impl CoordinationPayload {
    pub fn kind(&self) -> CoordinationKind {
        match self {
            Self::Spawn { .. } => CoordinationKind::Spawn,
            Self::Terminate { .. } => CoordinationKind::Terminate,
            Self::TaskAssign { .. } => CoordinationKind::TaskAssign,
            Self::StatusUpdate { .. } => CoordinationKind::StatusUpdate,
            Self::ResourceRequest(_) => CoordinationKind::ResourceRequest,
        }
    }
}

/// An instruction about one agent. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub message_id: MessageId,
    pub agent_id: AgentId,
    pub source_node: NodeId,
    /// Node the message is about or addressed to. `None` means the node
    /// applying the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: CoordinationPayload,
}

impl CoordinationMessage {
    pub fn new(source_node: NodeId, agent_id: AgentId, payload: CoordinationPayload) -> Self {
        Self {
            message_id: MessageId::generate(),
            agent_id,
            source_node,
            target_node: None,
            priority: Priority::default(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn targeting(mut self, node: NodeId) -> Self {
        self.target_node = Some(node);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> CoordinationKind {
        self.payload.kind()
    }

    pub fn spawn(source: NodeId, agent_id: AgentId, agent_type: &str, requirements: ResourceSpec) -> Self {
        Self::new(
            source,
            agent_id,
            CoordinationPayload::Spawn {
                agent_type: agent_type.to_string(),
                requirements,
                config: serde_json::Value::Null,
            },
        )
    }

    pub fn terminate(source: NodeId, agent_id: AgentId) -> Self {
        Self::new(source, agent_id, CoordinationPayload::Terminate { reason: None })
    }
}

/// Result reported back to the logical sender of a coordination message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyStatus {
    Applied { detail: String },
    Granted,
    Denied { reason: String },
    Failed { error: String },
    Pending { proposal_id: ProposalId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationReply {
    pub in_reply_to: MessageId,
    pub agent_id: AgentId,
    pub kind: CoordinationKind,
    pub responder: NodeId,
    pub status: ReplyStatus,
}

/// Flooded by a host once an agent it owned is gone, so other nodes can
/// drop it from their directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReleased {
    pub agent_id: AgentId,
    pub owner: NodeId,
}

// ── Consensus ──

/// A proposal broadcast to the electorate snapshotted at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalParams {
    pub proposal_id: ProposalId,
    pub epoch: u64,
    pub proposer: NodeId,
    pub data: ProposalData,
    pub electorate: Vec<NodeId>,
    pub quorum: usize,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteParams {
    pub proposal_id: ProposalId,
    pub proposer: NodeId,
    pub epoch: u64,
    pub voter: NodeId,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Terminal decision announced by the proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitParams {
    pub proposal_id: ProposalId,
    pub proposer: NodeId,
    pub epoch: u64,
    pub outcome: ProposalOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    pub data: ProposalData,
}

// ── Signaling ──

/// Identity material exchanged before a data channel exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    pub timestamp: u64,
    pub nonce: String,
    /// Hex ed25519 public key, present when secure transport is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Hex signature over the handshake signing payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Handshake {
    pub fn new(node_id: NodeId, listen_addr: Option<String>) -> Self {
        Self {
            node_id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            listen_addr,
            timestamp: crate::crypto::current_timestamp_secs(),
            nonce: uuid::Uuid::new_v4().to_string(),
            public_key: None,
            signature: None,
        }
    }

    /// Canonical bytes covered by the handshake signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.node_id, self.protocol_version, self.timestamp, self.nonce
        )
        .into_bytes()
    }
}

/// Offer/answer/candidate exchange performed by the signaling step of
/// `connect_to_peer` before the channel is upgraded to data frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer { handshake: Handshake },
    Answer { handshake: Handshake },
    Candidate { addr: String },
    Reject { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let env = Envelope::broadcast(
            NodeId::new("node-a"),
            3,
            MessageBody::Application(serde_json::json!({"hello": "mesh"})),
        );
        let bytes = env.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["body"]["method"], "app.message");
        assert_eq!(json["ttl"], 3);
        assert!(json.get("target").is_none());

        let parsed = Envelope::decode(&bytes).unwrap();
        assert_eq!(parsed.message_id, env.message_id);
        assert_eq!(parsed.method(), ProtocolMethod::Application);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Envelope::decode(b"{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        let blank_origin = serde_json::json!({
            "message_id": "m1",
            "origin": "",
            "ttl": 1,
            "hop": 0,
            "sent_at": Utc::now(),
            "body": {"method": "app.message", "params": null},
        });
        let bytes = serde_json::to_vec(&blank_origin).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_protocol_method_roundtrip() {
        let methods = vec![
            ProtocolMethod::Heartbeat,
            ProtocolMethod::Coordination,
            ProtocolMethod::AgentReleased,
            ProtocolMethod::Proposal,
            ProtocolMethod::Vote,
            ProtocolMethod::Commit,
        ];
        for method in methods {
            let s = method.as_str();
            let parsed = ProtocolMethod::from_str(s);
            assert_eq!(parsed, Some(method), "Failed to parse: {}", s);
        }
        assert!(ProtocolMethod::Vote.is_consensus());
        assert!(!ProtocolMethod::Heartbeat.is_consensus());
    }

    #[test]
    fn test_coordination_message_wire_shape() {
        let msg = CoordinationMessage::new(
            NodeId::new("node-a"),
            AgentId::new("a1"),
            CoordinationPayload::ResourceRequest(ResourceSpec::cpu(1000.0)),
        )
        .with_priority(Priority::High);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RESOURCE_REQUEST");
        assert_eq!(json["priority"], "HIGH");
        assert_eq!(json["payload"]["cpu"], 1000.0);

        let back: CoordinationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), CoordinationKind::ResourceRequest);
        assert_eq!(back, msg);
    }

    #[test]
    fn test_signaling_tagging() {
        let offer = SignalingMessage::Offer {
            handshake: Handshake::new(NodeId::new("node-a"), Some("127.0.0.1:7000".into())),
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["signal"], "offer");
        assert_eq!(json["handshake"]["protocol_version"], PROTOCOL_VERSION);
    }
}
