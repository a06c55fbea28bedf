//! Definition store boundary.
//!
//! The engine never loads or saves definitions itself; callers fetch one
//! from a store, [`load`](crate::WorkflowEngine::load) it and start runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::WorkflowDefinition;

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace by ID; bumps `updated_at`.
    async fn save(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError>;
    async fn load(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError>;
    /// Definitions ordered by name.
    async fn list(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<Uuid, WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn save(&self, mut definition: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        definition.updated_at = Utc::now();
        self.definitions.write().await.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.definitions.read().await.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut all: Vec<_> = self.definitions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}
