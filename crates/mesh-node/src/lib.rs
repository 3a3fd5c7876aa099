//! Mesh Node - the network manager facade
//!
//! Wires the lower crates into one running node:
//! - [`NetworkManager`]: lifecycle, peers, messaging, agents, consensus and
//!   topology behind a single cloneable handle
//! - [`NodeConfig`]: TOML configuration with defaults for every field
//! - [`NetworkEvent`] and [`EventListener`]: ordered event delivery

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod stats;

pub use config::{NodeConfig, SignalingEndpoint};
pub use error::NodeError;
pub use events::{ChannelListener, EventListener, FaultKind, NetworkEvent};
pub use manager::{Collaborators, NetworkManager};
pub use stats::{NetworkStats, NodeCounters};
