//! Event publisher trait and implementations.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::events::SagaEvent;

/// Failure to hand an event to the bus.
#[derive(Debug, Error)]
#[error("Failed to publish {event_type}: {reason}")]
pub struct PublishError {
    pub event_type: &'static str,
    pub reason: String,
}

/// Announces saga lifecycle events.
///
/// Publishing is a notification: a failure is logged by the orchestrator
/// and never changes saga state.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SagaEvent) -> Result<(), PublishError>;
}

/// Publisher that writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: SagaEvent) -> Result<(), PublishError> {
        tracing::info!(
            event_type = event.event_type(),
            saga_id = %event.saga_id(),
            correlation_id = event.correlation_id(),
            step = event.step_name().unwrap_or_default(),
            "saga event"
        );
        Ok(())
    }
}

/// In-memory publisher for testing; keeps every event in order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    events: Arc<RwLock<Vec<SagaEvent>>>,
    fail: Arc<RwLock<bool>>,
}

impl InMemoryEventPublisher {
    /// Creates an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail.
    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    /// All published events, oldest first.
    pub async fn events(&self) -> Vec<SagaEvent> {
        self.events.read().await.clone()
    }

    /// Event type names, oldest first.
    pub async fn event_types(&self) -> Vec<&'static str> {
        self.events
            .read()
            .await
            .iter()
            .map(SagaEvent::event_type)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: SagaEvent) -> Result<(), PublishError> {
        if *self.fail.read().await {
            return Err(PublishError {
                event_type: event.event_type(),
                reason: "bus unavailable".to_string(),
            });
        }
        self.events.write().await.push(event);
        Ok(())
    }
}
