//! Mesh Network - peer connections, routing and topology
//!
//! Provides the connection-level half of the agent mesh:
//! - Pluggable transports behind [`Transport`] / [`TransportChannel`]
//!   (in-process loopback for tests, TCP for real deployments)
//! - The [`PeerRegistry`], which owns every open channel and enforces the
//!   peer connection state machine
//! - The [`MessageRouter`], which applies TTL, dedup and rate limits and
//!   floods broadcasts to connected peers
//! - Topology snapshots, health scoring and rebalancing plans

pub mod error;
pub mod loopback;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod tcp;
pub mod topology;
pub mod transport;

pub use error::{NetworkError, TransportError};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use rate_limit::RateLimiter;
pub use registry::{PeerRecord, PeerRegistry, SweepReport};
pub use router::{DropReason, FloodReport, MessageRouter, RouteDecision, RouterStats};
pub use tcp::TcpTransport;
pub use topology::{
    Alert, AlertKind, ComponentScores, HealthInputs, NetworkHealth, NetworkTopology, PeerLink,
    TopologyAction, TopologyConfig,
};
pub use transport::{Connection, HandshakeSource, Transport, TransportChannel, TransportEvent};
