//! Registry of workflow definitions by id.

use std::sync::Arc;

use dashmap::DashMap;

use super::definition::WorkflowDefinition;
use super::error::EngineError;

pub struct DefinitionRegistry<P> {
    definitions: DashMap<String, Arc<WorkflowDefinition<P>>>,
}

impl<P> DefinitionRegistry<P> {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
        }
    }

    /// Register a definition. A newer version replaces an older one; the same
    /// or an older version is rejected.
    pub fn register(&self, definition: WorkflowDefinition<P>) -> Result<(), EngineError> {
        if let Some(existing) = self.definitions.get(definition.id()) {
            if existing.version() >= definition.version() {
                return Err(EngineError::Validation(format!(
                    "definition '{}' version {} is already registered",
                    definition.id(),
                    existing.version()
                )));
            }
        }
        tracing::info!(
            definition_id = definition.id(),
            version = definition.version(),
            "workflow definition registered"
        );
        self.definitions
            .insert(definition.id().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition<P>>, EngineError> {
        self.definitions
            .get(id)
            .map(|d| d.value().clone())
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl<P> Default for DefinitionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
