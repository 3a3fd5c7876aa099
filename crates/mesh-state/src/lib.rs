//! Mesh State - agents owned by this node and the resources they hold
//!
//! - [`ResourceLedger`]: capacity ceiling and per-agent reservations
//! - [`AgentCoordinator`]: applies coordination messages and committed
//!   proposals to the local agent table
//! - [`collaborators`]: seams to the agent runtime, persistence and
//!   inference, with in-memory implementations
//! - [`NeuralRuntime`]: the built-in inference engine

pub mod collaborators;
pub mod coordinator;
pub mod ledger;
pub mod neural;

pub use collaborators::{
    AgentHandle, AgentLifecycle, AgentStore, CollaboratorError, InMemoryLifecycle, InMemoryStore,
    InferenceEngine, InferenceMetrics, InferenceOutput,
};
pub use coordinator::{
    AgentCoordinator, CoordinationError, CoordinationOutcome, CoordinatorConfig, RemoteAgent,
    ResyncReport,
};
pub use ledger::{ResourceDenial, ResourceLedger};
pub use neural::{BenchmarkResult, NeuralError, NeuralRuntime};
