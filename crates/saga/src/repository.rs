//! Persistence port for sagas and steps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{SagaId, StepId};
use tokio::sync::RwLock;

use crate::aggregate::{Saga, SagaStep};
use crate::error::RepositoryError;

/// Result type for repository operations.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Durable store for saga and step state.
///
/// The repository is the system of record but never originates
/// transitions; the orchestrator treats each write as authoritative.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Stores a new saga.
    async fn create_saga(&self, saga: &Saga) -> RepositoryResult<()>;

    /// Loads a saga; `None` if it doesn't exist.
    async fn get_saga(&self, saga_id: SagaId) -> RepositoryResult<Option<Saga>>;

    /// Replaces a stored saga.
    async fn update_saga(&self, saga: &Saga) -> RepositoryResult<()>;

    /// Stores a new step.
    async fn create_step(&self, step: &SagaStep) -> RepositoryResult<()>;

    /// Loads every step of a saga, ordered by step index.
    async fn get_steps_by_saga(&self, saga_id: SagaId) -> RepositoryResult<Vec<SagaStep>>;

    /// Replaces one stored step, leaving its siblings untouched.
    async fn update_step(&self, step: &SagaStep) -> RepositoryResult<()>;
}

/// In-memory repository for testing and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    sagas: Arc<RwLock<HashMap<SagaId, Saga>>>,
    steps: Arc<RwLock<HashMap<StepId, SagaStep>>>,
}

impl InMemorySagaRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sagas.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn create_saga(&self, saga: &Saga) -> RepositoryResult<()> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&saga.id) {
            return Err(RepositoryError::SagaExists(saga.id));
        }
        sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn get_saga(&self, saga_id: SagaId) -> RepositoryResult<Option<Saga>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn update_saga(&self, saga: &Saga) -> RepositoryResult<()> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&saga.id)
            .ok_or(RepositoryError::SagaMissing(saga.id))?;
        *stored = saga.clone();
        Ok(())
    }

    async fn create_step(&self, step: &SagaStep) -> RepositoryResult<()> {
        let mut steps = self.steps.write().await;
        if steps.contains_key(&step.id) {
            return Err(RepositoryError::StepExists(step.id));
        }
        steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_steps_by_saga(&self, saga_id: SagaId) -> RepositoryResult<Vec<SagaStep>> {
        let steps = self.steps.read().await;
        let mut found: Vec<SagaStep> = steps
            .values()
            .filter(|step| step.saga_id == saga_id)
            .cloned()
            .collect();
        found.sort_by_key(|step| step.step_index);
        Ok(found)
    }

    async fn update_step(&self, step: &SagaStep) -> RepositoryResult<()> {
        let mut steps = self.steps.write().await;
        let stored = steps
            .get_mut(&step.id)
            .ok_or(RepositoryError::StepMissing(step.id))?;
        *stored = step.clone();
        Ok(())
    }
}
