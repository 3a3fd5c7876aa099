//! Mesh Protocol - Core types and message definitions
//!
//! Defines the identities, data model and wire envelope shared by every
//! node in the agent mesh. Envelopes are JSON encoded and carry a
//! `method`/`params` body in the same spirit as JSON-RPC.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messages;
pub mod replay;
pub mod types;

pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
pub use replay::{ReplayWindow, SeenWindow};
