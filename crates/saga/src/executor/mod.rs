//! Step executor port: the engine's only way to reach remote services.

pub mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::SagaContext;
use crate::types::{CompensationResult, ExecutionResult, StepConfiguration};

pub use in_memory::InMemoryStepExecutor;

/// A remote call that failed before producing a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct StepCallError {
    /// Matched against a retry policy's `retry_on` list.
    pub code: String,
    pub message: String,
}

impl StepCallError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Everything a step call needs.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub saga_id: SagaId,
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub configuration: StepConfiguration,
    /// Derived timeout: the step's own timeout bounded by the saga's remaining time.
    pub timeout: Duration,
    pub context: SagaContext,
    pub input: Value,
    /// Outputs of the steps completed so far, keyed by step name.
    pub output: Map<String, Value>,
}

/// Everything a compensating call needs.
#[derive(Debug, Clone)]
pub struct CompensationInvocation {
    pub saga_id: SagaId,
    pub step_name: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub timeout: Duration,
    pub context: SagaContext,
    /// Output of the step being undone.
    pub step_output: Value,
}

/// Performs the remote calls behind steps and their compensations.
///
/// Returning `Ok` with `success: false` and returning `Err` are both
/// recorded as failed attempts.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: StepInvocation) -> Result<ExecutionResult, StepCallError>;

    async fn compensate(
        &self,
        invocation: CompensationInvocation,
    ) -> Result<CompensationResult, StepCallError>;
}
