use chrono::{DateTime, Utc};
use serde::Serialize;

use mesh_network::RouterStats;
use mesh_protocol::NodeId;

/// Counters the manager keeps outside the router and consensus engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeCounters {
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub coordination_applied: u64,
    pub coordination_failed: u64,
    pub proposals_started: u64,
    pub faults_detected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub peers_total: usize,
    pub peers_connected: usize,
    pub peers_live: usize,
    pub average_rtt_ms: Option<f64>,
    pub local_agents: usize,
    pub current_epoch: u64,
    pub proposals_pending: usize,
    pub proposals_committed: u64,
    pub proposals_rejected: u64,
    pub coordinator_halted: bool,
    pub event_listeners: usize,
    pub router: RouterStats,
    pub counters: NodeCounters,
}
