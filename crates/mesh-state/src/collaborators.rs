//! Seams to the parts of an agent that live outside the mesh.
//!
//! The coordinator only decides *that* an agent exists and where. Starting
//! and stopping the actual workload, persisting its state and running
//! inference for it are delegated through these traits.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use mesh_protocol::{AgentId, AgentSpec};

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Returned by [`AgentLifecycle::create`] for a started agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub started_at: DateTime<Utc>,
}

pub trait AgentLifecycle: Send + Sync {
    fn create(&self, spec: &AgentSpec) -> Result<AgentHandle, CollaboratorError>;

    fn destroy(&self, agent_id: &AgentId) -> Result<(), CollaboratorError>;
}

/// Opaque persistence of per-agent state.
pub trait AgentStore: Send + Sync {
    fn save(&self, agent_id: &AgentId, state: &serde_json::Value) -> Result<(), CollaboratorError>;

    fn load(&self, agent_id: &AgentId) -> Result<Option<serde_json::Value>, CollaboratorError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceMetrics {
    pub input_len: usize,
    pub duration_us: u64,
    /// Operations performed by the engine over its lifetime.
    pub operations: u64,
    pub memory_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub output: Vec<f32>,
    pub metrics: InferenceMetrics,
}

pub trait InferenceEngine: Send + Sync {
    fn run_inference<'a>(
        &'a self,
        agent_id: &'a AgentId,
        input: &'a [f32],
    ) -> BoxFuture<'a, Result<InferenceOutput, CollaboratorError>>;
}

/// Lifecycle that only tracks which agents are running.
#[derive(Debug, Default)]
pub struct InMemoryLifecycle {
    running: Mutex<HashMap<AgentId, AgentHandle>>,
}

impl InMemoryLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, agent_id: &AgentId) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl AgentLifecycle for InMemoryLifecycle {
    fn create(&self, spec: &AgentSpec) -> Result<AgentHandle, CollaboratorError> {
        let handle = AgentHandle {
            agent_id: spec.id.clone(),
            agent_type: spec.agent_type.clone(),
            started_at: Utc::now(),
        };
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.id.clone(), handle.clone());
        Ok(handle)
    }

    fn destroy(&self, agent_id: &AgentId) -> Result<(), CollaboratorError> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    states: Mutex<HashMap<AgentId, serde_json::Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentStore for InMemoryStore {
    fn save(&self, agent_id: &AgentId, state: &serde_json::Value) -> Result<(), CollaboratorError> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, agent_id: &AgentId) -> Result<Option<serde_json::Value>, CollaboratorError> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned())
    }
}
