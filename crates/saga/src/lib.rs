//! Saga orchestration engine for multi-step distributed transactions.
//!
//! A [`SagaDefinition`] describes the steps of a business process. The
//! [`Orchestrator`] stamps out saga instances from registered definitions
//! and drives them:
//!
//! 1. The [`ExecutionPlanner`] turns the steps into ordered levels
//!    (sequential, parallel, or dependency-driven).
//! 2. Each step passes its activation conditions ([`ConditionEvaluator`])
//!    and is dispatched through a [`StepExecutor`].
//! 3. Retryable failures are rescheduled with exponential backoff
//!    ([`RetryScheduler`]).
//! 4. A failure that can't be retried rolls back every completed step in
//!    reverse completion order ([`CompensationCoordinator`]).
//!
//! Persistence, remote calls, event publishing and time are collaborators
//! behind traits so the engine runs the same against in-memory test doubles
//! and real infrastructure.

pub mod aggregate;
pub mod blueprints;
pub mod clock;
pub mod compensation;
pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod publisher;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod state;
pub mod types;

pub use aggregate::{Saga, SagaStep};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compensation::{CompensationCoordinator, CompensationReport};
pub use condition::ConditionEvaluator;
pub use config::EngineConfig;
pub use context::SagaContext;
pub use definition::{SagaDefinition, StepDefinition};
pub use error::{RepositoryError, Result, SagaError, ValidationError};
pub use events::SagaEvent;
pub use executor::{
    CompensationInvocation, InMemoryStepExecutor, StepCallError, StepExecutor, StepInvocation,
};
pub use orchestrator::{Orchestrator, SagaStatusView};
pub use planner::ExecutionPlanner;
pub use publisher::{EventPublisher, InMemoryEventPublisher, LoggingEventPublisher, PublishError};
pub use registry::DefinitionRegistry;
pub use repository::{InMemorySagaRepository, SagaRepository};
pub use retry::RetryScheduler;
pub use state::{SagaStatus, StepStatus};
pub use types::{
    CompensationResult, CompensationStrategy, ExecutionMode, ExecutionResult, RetryPolicy,
    SagaType, StepConfiguration,
};
