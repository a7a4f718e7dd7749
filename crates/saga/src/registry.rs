//! Versioned store of saga definitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::DefinitionId;
use tokio::sync::RwLock;

use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::types::SagaType;

/// Holds every registered definition version, keyed by saga type.
///
/// Versions start at 1 and increase by one per registration of the same
/// type. A registered version is never replaced.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: Arc<RwLock<BTreeMap<SagaType, Vec<Arc<SagaDefinition>>>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `definition` and stores it as the next version of its type.
    pub async fn register(&self, mut definition: SagaDefinition) -> Result<Arc<SagaDefinition>> {
        definition.validate()?;

        let mut definitions = self.definitions.write().await;
        let versions = definitions.entry(definition.saga_type).or_default();
        definition.id = DefinitionId::new();
        definition.version = versions.last().map_or(1, |latest| latest.version + 1);

        tracing::info!(
            saga_type = %definition.saga_type,
            version = definition.version,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        let definition = Arc::new(definition);
        versions.push(Arc::clone(&definition));
        Ok(definition)
    }

    /// Returns the newest version registered for `saga_type`.
    pub async fn latest(&self, saga_type: SagaType) -> Option<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .await
            .get(&saga_type)
            .and_then(|versions| versions.last().cloned())
    }

    /// Returns a specific version.
    pub async fn get(&self, saga_type: SagaType, version: u32) -> Option<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .await
            .get(&saga_type)
            .and_then(|versions| versions.iter().find(|def| def.version == version).cloned())
    }

    /// Latest version of every registered type, ordered by type.
    pub async fn list(&self) -> Vec<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .await
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;
    use crate::error::{SagaError, ValidationError};

    fn definition(saga_type: SagaType) -> SagaDefinition {
        SagaDefinition::new("test", saga_type).step(StepDefinition::new("a", "svc", "/a"))
    }

    #[tokio::test]
    async fn test_versions_increase_per_type() {
        let registry = DefinitionRegistry::new();

        let v1 = registry.register(definition(SagaType::OrderProcessing)).await.unwrap();
        let v2 = registry.register(definition(SagaType::OrderProcessing)).await.unwrap();
        let other = registry.register(definition(SagaType::WalletTopUp)).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);
        assert_ne!(v1.id, v2.id);

        let latest = registry.latest(SagaType::OrderProcessing).await.unwrap();
        assert_eq!(latest.version, 2);
        let first = registry.get(SagaType::OrderProcessing, 1).await.unwrap();
        assert_eq!(first.id, v1.id);
        assert!(registry.get(SagaType::OrderProcessing, 3).await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_definition() {
        let registry = DefinitionRegistry::new();
        let invalid = SagaDefinition::new("broken", SagaType::KycVerification)
            .step(StepDefinition::new("a", "svc", "/a").depends_on("b"))
            .step(StepDefinition::new("b", "svc", "/b").depends_on("a"));

        let err = registry.register(invalid).await.unwrap_err();
        assert!(matches!(
            err,
            SagaError::DefinitionValidation(ValidationError::DependencyCycle(_))
        ));
        assert!(registry.latest(SagaType::KycVerification).await.is_none());
    }

    #[tokio::test]
    async fn test_list_returns_latest_per_type() {
        let registry = DefinitionRegistry::new();
        registry.register(definition(SagaType::OrderProcessing)).await.unwrap();
        registry.register(definition(SagaType::OrderProcessing)).await.unwrap();
        registry.register(definition(SagaType::PaymentProcessing)).await.unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|d| d.saga_type == SagaType::OrderProcessing && d.version == 2));
    }
}
