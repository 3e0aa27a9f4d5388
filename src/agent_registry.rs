//! The agent definition registry.
//!
//! Corresponds to spec §6 ("register_agent") and §5's "process-wide
//! read-mostly maps, populated before any run starts; they are not
//! mutated during a run" — the same shape as `ToolRegistry` and
//! `ProviderRegistry`, used by the spawner to resolve a `spawn_agents`
//! request's `agent_id` into a definition to instantiate.

use dashmap::DashMap;
use std::sync::Arc;

use crate::agent_def::AgentDefinition;
use crate::error::{Result, RuntimeError};

#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentDefinition>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: Arc<AgentDefinition>) -> Result<()> {
        let id = definition.id.clone();
        if self.agents.contains_key(&id) {
            return Err(RuntimeError::DuplicateAgent { id });
        }
        self.agents.insert(id, definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_ids() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(AgentDefinition::new("coder", "p", "m"))).unwrap();
        let err = registry.register(Arc::new(AgentDefinition::new("coder", "p2", "m2"))).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateAgent { .. }));
    }

    #[test]
    fn get_returns_none_for_unknown_id() {
        let registry = AgentRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn get_returns_registered_definition() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(AgentDefinition::new("coder", "p", "m"))).unwrap();
        let def = registry.get("coder").unwrap();
        assert_eq!(def.id, "coder");
    }
}
