//! Saga error types.

use common::{SagaId, StepId};
use thiserror::Error;

use crate::state::{SagaStatus, StepStatus};

/// A saga definition (or the steps stamped out of it) is not executable.
///
/// Validation errors are always raised before any side effect: the saga is
/// never created from an invalid definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The definition has no name.
    #[error("Definition name must not be empty")]
    EmptyName,

    /// The definition has no steps.
    #[error("Definition must contain at least one step")]
    NoSteps,

    /// A step has no name.
    #[error("Step at index {0} has no name")]
    UnnamedStep(usize),

    /// Two steps share a name.
    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    /// A required step field is empty.
    #[error("Step '{step}' is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },

    /// A step's compensation strategy needs an endpoint but none is configured.
    #[error("Step '{step}' uses {strategy} compensation but has no compensation endpoint")]
    MissingCompensationEndpoint { step: String, strategy: String },

    /// A dependency names a step that doesn't exist.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnresolvedDependency { step: String, dependency: String },

    /// A step lists itself as a dependency.
    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle among steps: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// A retry policy is not usable.
    #[error("Invalid retry policy for '{owner}': {reason}")]
    InvalidRetryPolicy { owner: String, reason: String },
}

/// Errors raised by a repository implementation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A saga with the same ID is already stored.
    #[error("Saga already exists: {0}")]
    SagaExists(SagaId),

    /// A step with the same ID is already stored.
    #[error("Step already exists: {0}")]
    StepExists(StepId),

    /// The saga to update doesn't exist.
    #[error("Saga not found in repository: {0}")]
    SagaMissing(SagaId),

    /// The step to update doesn't exist.
    #[error("Step not found in repository: {0}")]
    StepMissing(StepId),

    /// Storage backend failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The definition (or the plan derived from it) is invalid.
    #[error("Definition validation failed: {0}")]
    DefinitionValidation(#[from] ValidationError),

    /// No definition is registered for the requested saga type/version.
    #[error("No saga definition registered for '{0}'")]
    DefinitionNotFound(String),

    /// Saga not found.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// Step not found within a saga.
    #[error("Step '{step}' not found in saga {saga_id}")]
    StepNotFound { saga_id: SagaId, step: String },

    /// A saga status change that the state machine forbids.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A step status change that the state machine forbids.
    #[error("Invalid transition for step '{step}': {from} -> {to}")]
    InvalidStepTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    /// Saga or step is in the wrong state for the requested operation.
    #[error("Invalid state: expected {expected}, actual {actual}")]
    InvalidState { expected: String, actual: String },

    /// Another orchestrator run already drives this saga.
    #[error("Saga {0} is already being driven by an orchestrator run")]
    AlreadyRunning(SagaId),

    /// A compensating call failed and the saga needs operator attention.
    #[error("Compensation step '{step}' failed: {reason}")]
    Compensation { step: String, reason: String },

    /// The repository failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_steps() {
        let err = ValidationError::DependencyCycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Dependency cycle among steps: a, b");
    }

    #[test]
    fn test_validation_converts_into_saga_error() {
        let err: SagaError = ValidationError::NoSteps.into();
        assert!(matches!(
            err,
            SagaError::DefinitionValidation(ValidationError::NoSteps)
        ));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = SagaError::InvalidTransition {
            from: SagaStatus::Completed,
            to: SagaStatus::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "Invalid saga transition: completed -> cancelled"
        );
    }
}
