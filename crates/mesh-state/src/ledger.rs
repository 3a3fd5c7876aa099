use std::collections::HashMap;

use mesh_protocol::{AgentId, ResourceDimension, ResourceSpec};

/// Why a reservation or resource request was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceDenial {
    #[error("invalid resource request: {0}")]
    Invalid(String),

    /// Larger than the node could ever provide, regardless of load.
    #[error("{0} request exceeds the node ceiling")]
    ExceedsCeiling(ResourceDimension),

    #[error("agent limit of {0} reached")]
    AgentLimit(usize),

    #[error("insufficient {0} available")]
    Insufficient(ResourceDimension),
}

/// Resources reserved per agent against a fixed capacity ceiling.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    capacity: ResourceSpec,
    max_agents: usize,
    allocations: HashMap<AgentId, ResourceSpec>,
}

impl ResourceLedger {
    pub fn new(capacity: ResourceSpec, max_agents: usize) -> Self {
        Self {
            capacity,
            max_agents,
            allocations: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> &ResourceSpec {
        &self.capacity
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    /// Sum of every current reservation.
    pub fn allocated(&self) -> ResourceSpec {
        self.allocations
            .values()
            .fold(ResourceSpec::default(), |acc, r| acc.plus(r))
    }

    pub fn available(&self) -> ResourceSpec {
        self.capacity.minus(&self.allocated())
    }

    /// Check `request` without reserving. With `agent` set, the agent
    /// limit applies unless that agent already holds a reservation.
    pub fn check(&self, agent: Option<&AgentId>, request: &ResourceSpec) -> Result<(), ResourceDenial> {
        request.validate().map_err(ResourceDenial::Invalid)?;
        if let Some(dim) = request.first_exceeding(&self.capacity) {
            return Err(ResourceDenial::ExceedsCeiling(dim));
        }
        if let Some(agent) = agent {
            if !self.allocations.contains_key(agent) && self.allocations.len() >= self.max_agents {
                return Err(ResourceDenial::AgentLimit(self.max_agents));
            }
        }
        if let Some(dim) = request.first_exceeding(&self.available()) {
            return Err(ResourceDenial::Insufficient(dim));
        }
        Ok(())
    }

    /// Reserve for `agent`. Reserving again for the same agent is a no-op.
    pub fn reserve(&mut self, agent: &AgentId, request: &ResourceSpec) -> Result<(), ResourceDenial> {
        if self.allocations.contains_key(agent) {
            return Ok(());
        }
        self.check(Some(agent), request)?;
        self.allocations.insert(agent.clone(), *request);
        Ok(())
    }

    pub fn release(&mut self, agent: &AgentId) -> Option<ResourceSpec> {
        self.allocations.remove(agent)
    }

    pub fn is_reserved(&self, agent: &AgentId) -> bool {
        self.allocations.contains_key(agent)
    }

    pub fn reserved_agents(&self) -> impl Iterator<Item = &AgentId> {
        self.allocations.keys()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ResourceLedger {
        ResourceLedger::new(
            ResourceSpec {
                cpu: 16.0,
                memory: 32_768,
                storage: 100_000,
                bandwidth: 1_000,
                gpu_required: false,
            },
            2,
        )
    }

    #[test]
    fn test_ceiling_denial_is_deterministic() {
        let l = ledger();
        for _ in 0..3 {
            assert_eq!(
                l.check(None, &ResourceSpec::cpu(1000.0)),
                Err(ResourceDenial::ExceedsCeiling(ResourceDimension::Cpu))
            );
        }
    }

    #[test]
    fn test_reserve_is_idempotent_and_release_frees() {
        let mut l = ledger();
        let a = AgentId::new("a");
        l.reserve(&a, &ResourceSpec::cpu(10.0)).unwrap();
        l.reserve(&a, &ResourceSpec::cpu(10.0)).unwrap();
        assert_eq!(l.allocated().cpu, 10.0);
        assert_eq!(
            l.check(Some(&AgentId::new("b")), &ResourceSpec::cpu(8.0)),
            Err(ResourceDenial::Insufficient(ResourceDimension::Cpu))
        );
        assert_eq!(l.release(&a), Some(ResourceSpec::cpu(10.0)));
        assert!(l.check(Some(&AgentId::new("b")), &ResourceSpec::cpu(8.0)).is_ok());
    }

    #[test]
    fn test_agent_limit() {
        let mut l = ledger();
        l.reserve(&AgentId::new("a"), &ResourceSpec::cpu(1.0)).unwrap();
        l.reserve(&AgentId::new("b"), &ResourceSpec::cpu(1.0)).unwrap();
        assert_eq!(
            l.reserve(&AgentId::new("c"), &ResourceSpec::cpu(1.0)),
            Err(ResourceDenial::AgentLimit(2))
        );
    }

    #[test]
    fn test_gpu_needs_gpu_ceiling() {
        let l = ledger();
        let req = ResourceSpec {
            gpu_required: true,
            ..Default::default()
        };
        assert_eq!(
            l.check(None, &req),
            Err(ResourceDenial::ExceedsCeiling(ResourceDimension::Gpu))
        );
    }

    #[test]
    fn test_non_finite_request_is_invalid() {
        let l = ledger();
        assert!(matches!(
            l.check(None, &ResourceSpec::cpu(f64::NAN)),
            Err(ResourceDenial::Invalid(_))
        ));
    }
}
