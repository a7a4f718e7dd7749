//! Saga aggregate and its step records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{DefinitionId, SagaId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, StepStatus};
use crate::types::{
    CompensationResult, ExecutionMode, ExecutionResult, RetryPolicy, SagaType, StepConfiguration,
};

/// One execution of a multi-step business process.
///
/// A pure value type: storage mapping is the repository's concern. Status
/// changes go through [`Saga::transition_to`] so the state machine is always
/// enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    pub id: SagaId,
    pub definition_id: DefinitionId,
    pub definition_version: u32,
    pub name: String,
    pub saga_type: SagaType,
    status: SagaStatus,
    pub execution_mode: ExecutionMode,
    pub context: SagaContext,
    pub input_data: Value,
    /// Step outputs keyed by step name.
    pub output_data: Map<String, Value>,
    pub timeout: Duration,
    /// Default policy for steps without their own.
    pub retry_policy: RetryPolicy,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Advisory progress marker: index of the next level to run.
    pub current_step_index: usize,
    /// Step names in the order they completed.
    pub completed_steps: Vec<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl Saga {
    /// Creates a saga in the `created` status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definition_id: DefinitionId,
        definition_version: u32,
        name: impl Into<String>,
        saga_type: SagaType,
        execution_mode: ExecutionMode,
        context: SagaContext,
        input_data: Value,
        timeout: Duration,
        retry_policy: RetryPolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SagaId::new(),
            definition_id,
            definition_version,
            name: name.into(),
            saga_type,
            status: SagaStatus::Created,
            execution_mode,
            context,
            input_data,
            output_data: Map::new(),
            timeout,
            retry_policy,
            retry_count: 0,
            last_error: None,
            last_retry_at: None,
            current_step_index: 0,
            completed_steps: Vec::new(),
            cancellation_reason: None,
            created_at,
            started_at: None,
            expires_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelled_at: None,
            compensated_at: None,
        }
    }

    /// Returns the saga status.
    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Returns the correlation ID used for cross-service tracing.
    pub fn correlation_id(&self) -> &str {
        self.context.correlation_id()
    }

    /// Moves the saga to `next`, stamping the matching timestamp.
    ///
    /// Rejects any move the state machine forbids, including every move out
    /// of a terminal status.
    pub fn transition_to(&mut self, next: SagaStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            SagaStatus::Running => {
                self.started_at = Some(at);
                self.expires_at = chrono::Duration::from_std(self.timeout)
                    .ok()
                    .and_then(|timeout| at.checked_add_signed(timeout));
            }
            SagaStatus::Completed => self.completed_at = Some(at),
            SagaStatus::Failed | SagaStatus::CompensationFailed => self.failed_at = Some(at),
            SagaStatus::Timeout => self.expired_at = Some(at),
            SagaStatus::Cancelled => self.cancelled_at = Some(at),
            SagaStatus::Compensated => self.compensated_at = Some(at),
            SagaStatus::Created | SagaStatus::Compensating => {}
        }
        self.status = next;
        Ok(())
    }

    /// Returns true once `now` has reached the saga's expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Time left before expiry, `None` if the saga has no deadline yet.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Records a step's success: output accumulates and completion order is kept.
    pub fn record_step_completed(&mut self, step_name: &str, output: Value) {
        if !output.is_null() {
            self.output_data.insert(step_name.to_string(), output);
        }
        self.completed_steps.push(step_name.to_string());
    }

    /// Saga-wide retry bookkeeping.
    pub fn record_retry(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.last_retry_at = Some(at);
    }
}

/// One step of one saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub id: StepId,
    pub saga_id: SagaId,
    pub name: String,
    pub step_index: usize,
    status: StepStatus,
    pub configuration: StepConfiguration,
    execution_results: Vec<ExecutionResult>,
    compensation_results: Vec<CompensationResult>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    /// Creates a pending step.
    pub fn new(
        saga_id: SagaId,
        name: impl Into<String>,
        step_index: usize,
        configuration: StepConfiguration,
    ) -> Self {
        Self {
            id: StepId::new(),
            saga_id,
            name: name.into(),
            step_index,
            status: StepStatus::Pending,
            configuration,
            execution_results: Vec::new(),
            compensation_results: Vec::new(),
            retry_count: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    /// Returns the step status.
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Moves the step to `next`, stamping the matching timestamp.
    pub fn transition_to(&mut self, next: StepStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidStepTransition {
                step: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        match next {
            StepStatus::Running if self.started_at.is_none() => self.started_at = Some(at),
            StepStatus::Completed
            | StepStatus::Failed
            | StepStatus::Skipped
            | StepStatus::Timeout => self.completed_at = Some(at),
            StepStatus::Compensated => self.compensated_at = Some(at),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Appends an execution attempt to the audit trail.
    pub fn record_execution(&mut self, result: ExecutionResult) {
        if !result.success {
            self.last_error = result.error_message.clone().or(result.error_code.clone());
        }
        self.execution_results.push(result);
    }

    /// Appends a compensation attempt to the audit trail.
    pub fn record_compensation(&mut self, result: CompensationResult) {
        if !result.success {
            self.last_error = result.error_message.clone().or(result.error_code.clone());
        }
        self.compensation_results.push(result);
    }

    /// All execution attempts, oldest first.
    pub fn execution_results(&self) -> &[ExecutionResult] {
        &self.execution_results
    }

    /// All compensation attempts, oldest first.
    pub fn compensation_results(&self) -> &[CompensationResult] {
        &self.compensation_results
    }

    /// Output of the successful execution, if any.
    pub fn output(&self) -> Option<&Value> {
        self.execution_results
            .iter()
            .rev()
            .find(|result| result.success)
            .map(|result| &result.output)
    }

    /// Number of execution attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.execution_results.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::types::CompensationStrategy;

    fn make_saga() -> Saga {
        Saga::new(
            DefinitionId::new(),
            1,
            "test-saga",
            SagaType::OrderProcessing,
            ExecutionMode::Sequential,
            SagaContext::new().with_correlation_id("corr-1"),
            Value::Null,
            Duration::from_secs(60),
            RetryPolicy::default(),
            Utc::now(),
        )
    }

    fn make_step(saga_id: SagaId) -> SagaStep {
        SagaStep::new(
            saga_id,
            "reserve",
            0,
            StepConfiguration {
                service_name: "inventory".into(),
                endpoint: "/reserve".into(),
                method: "POST".into(),
                timeout: Duration::from_secs(5),
                retry_policy: None,
                compensation_strategy: CompensationStrategy::Automatic,
                compensation_endpoint: Some("/release".into()),
                dependencies: Vec::new(),
                conditions: BTreeMap::new(),
                metadata: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_new_saga_is_created() {
        let saga = make_saga();
        assert_eq!(saga.status(), SagaStatus::Created);
        assert_eq!(saga.correlation_id(), "corr-1");
        assert!(saga.started_at.is_none());
    }

    #[test]
    fn test_running_sets_expiry() {
        let mut saga = make_saga();
        let now = Utc::now();
        saga.transition_to(SagaStatus::Running, now).unwrap();

        assert_eq!(saga.started_at, Some(now));
        assert_eq!(saga.expires_at, Some(now + chrono::Duration::seconds(60)));
        assert!(!saga.is_expired(now));
        assert!(saga.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(saga.remaining(now), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_terminal_saga_rejects_transition() {
        let mut saga = make_saga();
        let now = Utc::now();
        saga.transition_to(SagaStatus::Running, now).unwrap();
        saga.transition_to(SagaStatus::Completed, now).unwrap();

        let err = saga
            .transition_to(SagaStatus::Cancelled, now)
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::InvalidTransition {
                from: SagaStatus::Completed,
                to: SagaStatus::Cancelled
            }
        ));
        assert_eq!(saga.status(), SagaStatus::Completed);
    }

    #[test]
    fn test_completion_order_and_output_accumulate() {
        let mut saga = make_saga();
        saga.record_step_completed("b", serde_json::json!({"id": 2}));
        saga.record_step_completed("a", Value::Null);

        assert_eq!(saga.completed_steps, vec!["b", "a"]);
        assert_eq!(saga.output_data.get("b"), Some(&serde_json::json!({"id": 2})));
        assert!(!saga.output_data.contains_key("a"));
    }

    #[test]
    fn test_step_history_is_append_only() {
        let saga = make_saga();
        let mut step = make_step(saga.id);
        step.record_execution(ExecutionResult::failure("SERVICE_UNAVAILABLE", "down"));
        step.record_execution(ExecutionResult::success(serde_json::json!({"ok": true})));

        assert_eq!(step.attempts(), 2);
        assert!(!step.execution_results()[0].success);
        assert_eq!(step.output(), Some(&serde_json::json!({"ok": true})));
        assert_eq!(step.last_error.as_deref(), Some("down"));
    }

    #[test]
    fn test_step_rejects_illegal_transition() {
        let saga = make_saga();
        let mut step = make_step(saga.id);
        let err = step
            .transition_to(StepStatus::Compensating, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidStepTransition { .. }));
    }
}
