//! Protocol-wide defaults. Every value here can be overridden through
//! the node configuration.

/// Version string exchanged during the signaling handshake.
pub const PROTOCOL_VERSION: &str = "mesh/1.0";

/// Default hop budget for flooded broadcasts.
pub const DEFAULT_TTL: u32 = 4;

/// Default capacity of the recently-seen message id window.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Default upper bound on simultaneously open peer connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default interval between heartbeats sent to every peer.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Missed heartbeat intervals before a peer is marked degraded.
pub const DEFAULT_DEGRADED_AFTER_MISSED: u32 = 3;

/// Missed heartbeat intervals before a peer is closed.
pub const DEFAULT_CLOSED_AFTER_MISSED: u32 = 6;

/// Default time a proposal may stay pending before it is rejected.
pub const DEFAULT_PROPOSAL_TIMEOUT_MS: u64 = 30_000;

/// Default time allowed for the signaling handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Largest frame accepted on a transport channel.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
