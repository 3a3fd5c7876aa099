//! Topology snapshots, health scoring and rebalancing plans.
//!
//! Everything here is a pure function of its inputs. The node gathers
//! the inputs under its state lock and calls in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use mesh_protocol::{AgentId, ConnectionState, NodeId};

use crate::registry::PeerRegistry;

const WEIGHT_CONNECTIVITY: f64 = 0.35;
const WEIGHT_LATENCY: f64 = 0.20;
const WEIGHT_CHURN: f64 = 0.20;
const WEIGHT_LIVENESS: f64 = 0.25;

/// RTT at or below which latency scores 100.
const LATENCY_GOOD_MS: f64 = 50.0;
/// RTT at or above which latency scores 0.
const LATENCY_BAD_MS: f64 = 1000.0;
/// Score lost per connect/disconnect event in the churn window.
const CHURN_PENALTY: f64 = 10.0;
/// Component scores below this raise an alert.
const ALERT_THRESHOLD: f64 = 50.0;
/// Overall score change that counts as a material health change.
const HEALTH_CHANGE_DELTA: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Lower end of the target degree band.
    pub min_degree: usize,
    /// Upper end of the target degree band.
    pub max_degree: usize,
    pub churn_window: Duration,
    /// Time without a commit after which liveness reaches 0, once
    /// proposals have started failing.
    pub liveness_horizon: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            min_degree: 2,
            max_degree: 8,
            churn_window: Duration::seconds(60),
            liveness_horizon: Duration::seconds(120),
        }
    }
}

/// One edge of the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLink {
    pub peer_id: NodeId,
    pub state: ConnectionState,
    pub rtt_estimate_ms: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time graph view of the local node and its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub node_id: NodeId,
    /// Local node plus live neighbors.
    pub total_nodes: usize,
    /// Connected and degraded peers, sorted.
    pub neighbors: Vec<NodeId>,
    pub links: Vec<PeerLink>,
    pub generated_at: DateTime<Utc>,
}

impl NetworkTopology {
    /// Snapshot the registry. Never mutates it.
    pub fn snapshot(registry: &PeerRegistry, now: DateTime<Utc>) -> Self {
        let neighbors = registry.live_peers();
        let mut links: Vec<PeerLink> = registry
            .records()
            .map(|r| PeerLink {
                peer_id: r.peer_id.clone(),
                state: r.state,
                rtt_estimate_ms: r.rtt_estimate_ms,
                last_seen: r.last_seen,
            })
            .collect();
        links.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Self {
            node_id: registry.local_id().clone(),
            total_nodes: neighbors.len() + 1,
            neighbors,
            links,
            generated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub connectivity: f64,
    pub latency: f64,
    pub churn: f64,
    pub consensus_liveness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowConnectivity,
    HighLatency,
    HighChurn,
    ConsensusStalled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkHealth {
    /// 0..=100
    pub overall_score: f64,
    pub component_scores: ComponentScores,
    pub active_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl NetworkHealth {
    /// Whether `self` differs enough from `previous` to be announced.
    pub fn differs_materially(&self, previous: &NetworkHealth) -> bool {
        if (self.overall_score - previous.overall_score).abs() >= HEALTH_CHANGE_DELTA {
            return true;
        }
        let kinds = |h: &NetworkHealth| h.active_alerts.iter().map(|a| a.kind).collect::<Vec<_>>();
        kinds(self) != kinds(previous)
    }

    pub fn has_alert(&self, kind: AlertKind) -> bool {
        self.active_alerts.iter().any(|a| a.kind == kind)
    }
}

/// Raw measurements the health score is computed from.
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub connected: usize,
    pub avg_rtt_ms: Option<f64>,
    /// Connect/disconnect events within the churn window.
    pub churn_events: usize,
    pub last_commit_at: Option<DateTime<Utc>>,
    /// Proposals rejected since the last commit.
    pub rejections_since_commit: usize,
    /// When the node started; stands in for the last commit before any.
    pub started_at: DateTime<Utc>,
}

pub fn compute_health(inputs: &HealthInputs, config: &TopologyConfig, now: DateTime<Utc>) -> NetworkHealth {
    let connectivity = if config.min_degree == 0 {
        100.0
    } else {
        (inputs.connected as f64 / config.min_degree as f64).min(1.0) * 100.0
    };

    let latency = match inputs.avg_rtt_ms {
        None => 100.0,
        Some(rtt) if rtt <= LATENCY_GOOD_MS => 100.0,
        Some(rtt) if rtt >= LATENCY_BAD_MS => 0.0,
        Some(rtt) => 100.0 * (LATENCY_BAD_MS - rtt) / (LATENCY_BAD_MS - LATENCY_GOOD_MS),
    };

    let churn = (100.0 - CHURN_PENALTY * inputs.churn_events as f64).max(0.0);

    // Liveness only decays once proposals have started failing; an idle mesh
    // that proposes nothing is not unhealthy.
    let consensus_liveness = if inputs.rejections_since_commit == 0 {
        100.0
    } else {
        let since = inputs.last_commit_at.unwrap_or(inputs.started_at);
        let elapsed = (now - since).num_milliseconds().max(0) as f64;
        let horizon = config.liveness_horizon.num_milliseconds().max(1) as f64;
        (100.0 * (1.0 - elapsed / horizon)).clamp(0.0, 100.0)
    };

    let overall = (WEIGHT_CONNECTIVITY * connectivity
        + WEIGHT_LATENCY * latency
        + WEIGHT_CHURN * churn
        + WEIGHT_LIVENESS * consensus_liveness)
        .clamp(0.0, 100.0);

    let mut alerts = Vec::new();
    let mut recommendations = Vec::new();
    if connectivity < ALERT_THRESHOLD {
        alerts.push(Alert {
            kind: AlertKind::LowConnectivity,
            message: format!(
                "{} connected peers, target at least {}",
                inputs.connected, config.min_degree
            ),
        });
        recommendations.push("increase peer discovery".to_string());
    }
    if latency < ALERT_THRESHOLD {
        alerts.push(Alert {
            kind: AlertKind::HighLatency,
            message: format!("average rtt {:.0} ms", inputs.avg_rtt_ms.unwrap_or_default()),
        });
        recommendations.push("prefer lower-latency peers".to_string());
    }
    if churn < ALERT_THRESHOLD {
        alerts.push(Alert {
            kind: AlertKind::HighChurn,
            message: format!(
                "{} connection changes in the last {} s",
                inputs.churn_events,
                config.churn_window.num_seconds()
            ),
        });
        recommendations.push("investigate unstable peers".to_string());
    }
    if consensus_liveness < ALERT_THRESHOLD {
        alerts.push(Alert {
            kind: AlertKind::ConsensusStalled,
            message: format!(
                "{} proposals rejected since the last commit",
                inputs.rejections_since_commit
            ),
        });
        recommendations.push("check quorum availability".to_string());
    }

    NetworkHealth {
        overall_score: overall,
        component_scores: ComponentScores {
            connectivity,
            latency,
            churn,
            consensus_liveness,
        },
        active_alerts: alerts,
        recommendations,
        computed_at: now,
    }
}

/// A step toward the target degree band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TopologyAction {
    Connect { peer: NodeId },
    Disconnect { peer: NodeId },
    /// The peer hosts agents this node sponsored. Their migration must be
    /// agreed before the peer may be dropped.
    MigrateThenDisconnect { peer: NodeId, agents: Vec<AgentId> },
}

/// Plan connect/disconnect actions moving the degree into
/// `[min_degree, max_degree]`.
///
/// Below the band, unconnected `candidates` are dialed in order. Above it,
/// degraded peers go first, then the slowest. Peers listed in `pinned`
/// are never plainly disconnected.
pub fn plan_optimization(
    registry: &PeerRegistry,
    candidates: &[NodeId],
    pinned: &HashMap<NodeId, Vec<AgentId>>,
    config: &TopologyConfig,
) -> Vec<TopologyAction> {
    let live = registry.live_peers();
    let degree = live.len();
    let mut actions = Vec::new();

    if degree < config.min_degree {
        let missing = config.min_degree - degree;
        actions.extend(
            candidates
                .iter()
                .filter(|c| *c != registry.local_id() && registry.get(c).is_none())
                .take(missing)
                .map(|peer| TopologyAction::Connect { peer: peer.clone() }),
        );
    } else if degree > config.max_degree {
        let excess = degree - config.max_degree;
        // Rank: degraded first, then highest RTT, then id for determinism.
        let mut ranked: BTreeMap<(u8, i64, NodeId), NodeId> = BTreeMap::new();
        for peer in live {
            let Some(record) = registry.get(&peer) else { continue };
            let healthy = u8::from(record.state != ConnectionState::Degraded);
            let rtt = record.rtt_estimate_ms.unwrap_or(0.0).round() as i64;
            ranked.insert((healthy, -rtt, peer.clone()), peer);
        }
        for peer in ranked.into_values().take(excess) {
            match pinned.get(&peer) {
                Some(agents) if !agents.is_empty() => {
                    actions.push(TopologyAction::MigrateThenDisconnect {
                        peer,
                        agents: agents.clone(),
                    })
                }
                _ => actions.push(TopologyAction::Disconnect { peer }),
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::recording_conn;

    fn registry_with(peers: &[&str]) -> PeerRegistry {
        let now = Utc::now();
        let mut reg = PeerRegistry::new(NodeId::new("local"), 16);
        for (i, p) in peers.iter().enumerate() {
            let (conn, _) = recording_conn(p, i as u64 + 1);
            reg.insert(conn, now).unwrap();
            reg.mark_connected(&NodeId::new(*p), now).unwrap();
        }
        reg
    }

    fn inputs(connected: usize) -> HealthInputs {
        HealthInputs {
            connected,
            avg_rtt_ms: Some(20.0),
            churn_events: 0,
            last_commit_at: None,
            rejections_since_commit: 0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_reflects_registry() {
        let reg = registry_with(&["node-c", "node-b"]);
        let topo = NetworkTopology::snapshot(&reg, Utc::now());
        assert_eq!(topo.node_id, NodeId::new("local"));
        assert_eq!(topo.total_nodes, 3);
        assert_eq!(topo.neighbors, vec![NodeId::new("node-b"), NodeId::new("node-c")]);
    }

    #[test]
    fn test_healthy_mesh_scores_full() {
        let cfg = TopologyConfig::default();
        let health = compute_health(&inputs(2), &cfg, Utc::now());
        assert!((health.overall_score - 100.0).abs() < 1e-9);
        assert!(health.active_alerts.is_empty());
    }

    #[test]
    fn test_isolated_node_recommends_discovery() {
        let cfg = TopologyConfig::default();
        let health = compute_health(&inputs(0), &cfg, Utc::now());
        assert_eq!(health.component_scores.connectivity, 0.0);
        assert!(health.has_alert(AlertKind::LowConnectivity));
        assert!(health.recommendations.iter().any(|r| r == "increase peer discovery"));
        assert!(health.overall_score <= 65.0 + 1e-9);
    }

    #[test]
    fn test_latency_and_churn_scoring() {
        let cfg = TopologyConfig::default();
        let mut i = inputs(2);
        i.avg_rtt_ms = Some(525.0);
        i.churn_events = 3;
        let health = compute_health(&i, &cfg, Utc::now());
        assert!((health.component_scores.latency - 50.0).abs() < 1e-9);
        assert!((health.component_scores.churn - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_liveness_decays_only_after_rejections() {
        let cfg = TopologyConfig::default();
        let start = Utc::now();
        let mut i = inputs(2);
        i.started_at = start;
        let later = start + Duration::seconds(90);
        assert_eq!(compute_health(&i, &cfg, later).component_scores.consensus_liveness, 100.0);
        i.rejections_since_commit = 2;
        let h = compute_health(&i, &cfg, later);
        assert!((h.component_scores.consensus_liveness - 25.0).abs() < 1e-6);
        assert!(h.has_alert(AlertKind::ConsensusStalled));
    }

    #[test]
    fn test_plan_connects_when_below_band() {
        let reg = registry_with(&["node-b"]);
        let cfg = TopologyConfig {
            min_degree: 3,
            ..Default::default()
        };
        let candidates = vec![NodeId::new("node-b"), NodeId::new("node-c"), NodeId::new("node-d"), NodeId::new("node-e")];
        let actions = plan_optimization(&reg, &candidates, &HashMap::new(), &cfg);
        assert_eq!(
            actions,
            vec![
                TopologyAction::Connect { peer: NodeId::new("node-c") },
                TopologyAction::Connect { peer: NodeId::new("node-d") },
            ]
        );
    }

    #[test]
    fn test_plan_never_plainly_drops_pinned_peer() {
        let mut reg = registry_with(&["node-b", "node-c", "node-d"]);
        reg.record_rtt(&NodeId::new("node-b"), 900.0);
        reg.record_rtt(&NodeId::new("node-c"), 10.0);
        reg.record_rtt(&NodeId::new("node-d"), 500.0);
        let cfg = TopologyConfig {
            min_degree: 0,
            max_degree: 1,
            ..Default::default()
        };
        let mut pinned = HashMap::new();
        pinned.insert(NodeId::new("node-b"), vec![AgentId::new("a1")]);
        let actions = plan_optimization(&reg, &[], &pinned, &cfg);
        assert_eq!(
            actions,
            vec![
                TopologyAction::MigrateThenDisconnect {
                    peer: NodeId::new("node-b"),
                    agents: vec![AgentId::new("a1")],
                },
                TopologyAction::Disconnect { peer: NodeId::new("node-d") },
            ]
        );
    }
}
