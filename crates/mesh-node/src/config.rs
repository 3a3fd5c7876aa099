//! Node configuration, loaded from `~/.config/agent-mesh/node.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-node setup listening on localhost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use mesh_consensus::ConsensusConfig;
use mesh_network::TopologyConfig;
use mesh_protocol::{
    NodeId, ResourceSpec, DEFAULT_CLOSED_AFTER_MISSED, DEFAULT_DEDUP_CAPACITY,
    DEFAULT_DEGRADED_AFTER_MISSED, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_PROPOSAL_TIMEOUT_MS, DEFAULT_TTL,
};
use mesh_state::CoordinatorConfig;

use crate::NodeError;

/// Upper bound for every configured interval or timeout (one day).
const MAX_TIMING_MS: u64 = 86_400_000;
/// Upper bound for the missed-heartbeat thresholds.
const MAX_MISSED_HEARTBEATS: u32 = 10_000;

/// How nodes find and reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingEndpoint {
    /// In-process hub shared by every node in one process.
    Loopback,
    /// TCP listener plus the static `[network.peers]` address directory.
    #[default]
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub max_connections: usize,
    pub enable_secure_transport: bool,
    pub signaling_endpoint: SignalingEndpoint,
    /// Where the ed25519 seed lives. A fresh key is generated per run when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key_path: Option<PathBuf>,
    pub network: NetworkSection,
    pub consensus: ConsensusSection,
    pub topology: TopologySection,
    pub resources: ResourcesSection,
    pub logging: LoggingSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            enable_secure_transport: true,
            signaling_endpoint: SignalingEndpoint::default(),
            identity_key_path: None,
            network: NetworkSection::default(),
            consensus: ConsensusSection::default(),
            topology: TopologySection::default(),
            resources: ResourcesSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub listen_addr: String,
    /// Static directory of peer node ids to `host:port`.
    pub peers: HashMap<String, String>,
    /// Dial every directory entry during `initialize`.
    pub connect_on_start: bool,
    pub default_ttl: u32,
    pub dedup_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// Silent heartbeat intervals before a peer is marked degraded.
    pub degraded_after_missed: u32,
    /// Silent heartbeat intervals before a peer is closed.
    pub closed_after_missed: u32,
    pub handshake_timeout_ms: u64,
    /// Inbound frames a peer may burst before being throttled.
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: f64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7400".to_string(),
            peers: HashMap::new(),
            connect_on_start: true,
            default_ttl: DEFAULT_TTL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            degraded_after_missed: DEFAULT_DEGRADED_AFTER_MISSED,
            closed_after_missed: DEFAULT_CLOSED_AFTER_MISSED,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            rate_limit_burst: 200,
            rate_limit_per_sec: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub proposal_timeout_ms: u64,
    /// How often expired proposals are swept.
    pub sweep_interval_ms: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            proposal_timeout_ms: DEFAULT_PROPOSAL_TIMEOUT_MS,
            sweep_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySection {
    pub min_degree: usize,
    pub max_degree: usize,
    pub churn_window_secs: u64,
    pub health_interval_ms: u64,
    pub liveness_horizon_secs: u64,
}

impl Default for TopologySection {
    fn default() -> Self {
        Self {
            min_degree: 2,
            max_degree: 8,
            churn_window_secs: 60,
            health_interval_ms: 5_000,
            liveness_horizon_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub capacity: ResourceSpec,
    pub max_agents: usize,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            capacity: defaults.capacity,
            max_agents: defaults.max_agents,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Default configuration for `node_id`.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-mesh")
            .join("node.toml")
    }

    /// Read and parse a config file. Missing sections take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating config file {}", path.display()))?;
        tracing::info!(path = %path.display(), node_id = %config.node_id, "Loaded configuration");
        Ok(config)
    }

    /// Load `path` (or the default path). A missing file yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let invalid = |msg: String| Err(NodeError::Config(msg));
        if self.node_id.trim().is_empty() {
            return invalid("node_id must not be empty".into());
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1".into());
        }
        if self.network.heartbeat_interval_ms == 0 {
            return invalid("network.heartbeat_interval_ms must be positive".into());
        }
        if self.network.degraded_after_missed == 0
            || self.network.closed_after_missed <= self.network.degraded_after_missed
        {
            return invalid(format!(
                "network.closed_after_missed ({}) must exceed degraded_after_missed ({}) which must be positive",
                self.network.closed_after_missed, self.network.degraded_after_missed
            ));
        }
        if self.network.closed_after_missed > MAX_MISSED_HEARTBEATS {
            return invalid(format!(
                "network.closed_after_missed ({}) exceeds {MAX_MISSED_HEARTBEATS}",
                self.network.closed_after_missed
            ));
        }
        let timings = [
            ("network.heartbeat_interval_ms", self.network.heartbeat_interval_ms),
            ("network.handshake_timeout_ms", self.network.handshake_timeout_ms),
            ("consensus.proposal_timeout_ms", self.consensus.proposal_timeout_ms),
            ("consensus.sweep_interval_ms", self.consensus.sweep_interval_ms),
            ("topology.health_interval_ms", self.topology.health_interval_ms),
            ("topology.churn_window_secs", self.topology.churn_window_secs.saturating_mul(1000)),
            ("topology.liveness_horizon_secs", self.topology.liveness_horizon_secs.saturating_mul(1000)),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, ms)| *ms > MAX_TIMING_MS) {
            return invalid(format!("{name} exceeds one day"));
        }
        if self.network.dedup_capacity == 0 {
            return invalid("network.dedup_capacity must be positive".into());
        }
        if self.network.rate_limit_burst == 0 || !(self.network.rate_limit_per_sec > 0.0) {
            return invalid("network rate limit must be positive".into());
        }
        if self.consensus.proposal_timeout_ms == 0 || self.consensus.sweep_interval_ms == 0 {
            return invalid("consensus timings must be positive".into());
        }
        if self.topology.min_degree > self.topology.max_degree {
            return invalid(format!(
                "topology.min_degree ({}) exceeds max_degree ({})",
                self.topology.min_degree, self.topology.max_degree
            ));
        }
        if self.topology.health_interval_ms == 0 {
            return invalid("topology.health_interval_ms must be positive".into());
        }
        if let Err(reason) = self.resources.capacity.validate() {
            return invalid(format!("resources.capacity: {reason}"));
        }
        if self.network.peers.contains_key(&self.node_id) {
            return invalid(format!("node {} lists itself as a peer", self.node_id));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.network.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.network.handshake_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.consensus.sweep_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.topology.health_interval_ms)
    }

    /// Peer directory as typed ids, sorted for deterministic dialing.
    pub fn peer_directory(&self) -> Vec<(NodeId, String)> {
        let mut peers: Vec<(NodeId, String)> = self
            .network
            .peers
            .iter()
            .map(|(id, addr)| (NodeId::new(id.clone()), addr.clone()))
            .collect();
        peers.sort();
        peers
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            proposal_timeout: chrono::Duration::milliseconds(self.consensus.proposal_timeout_ms as i64),
            ..ConsensusConfig::default()
        }
    }

    pub fn topology_config(&self) -> TopologyConfig {
        TopologyConfig {
            min_degree: self.topology.min_degree,
            max_degree: self.topology.max_degree,
            churn_window: chrono::Duration::seconds(self.topology.churn_window_secs as i64),
            liveness_horizon: chrono::Duration::seconds(self.topology.liveness_horizon_secs as i64),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            capacity: self.resources.capacity,
            max_agents: self.resources.max_agents,
            dedup_capacity: self.network.dedup_capacity,
        }
    }
}
