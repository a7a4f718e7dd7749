//! Rollback of completed steps in reverse completion order.

use std::time::Instant;

use tracing::{info, warn};

use crate::aggregate::{Saga, SagaStep};
use crate::clock::Clock;
use crate::error::Result;
use crate::executor::{CompensationInvocation, StepExecutor};
use crate::state::StepStatus;
use crate::types::{CompensationResult, CompensationStrategy, TIMEOUT_ERROR_CODE};

/// Where a rollback stopped because a non-best-effort compensation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationHalt {
    pub step: String,
    pub reason: String,
}

/// What a rollback did, step by step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Completed steps in the order they were processed (last completed first).
    pub processed: Vec<String>,
    /// Steps whose compensating call succeeded.
    pub compensated: Vec<String>,
    /// `best_effort` steps whose compensating call failed.
    pub best_effort_failures: Vec<String>,
    /// `manual` steps left in `compensating` for an operator.
    pub pending_manual: Vec<String>,
    /// `none` steps left as completed.
    pub untouched: Vec<String>,
    /// Set when an `automatic` compensation failed and the rollback stopped.
    pub halted: Option<CompensationHalt>,
}

impl CompensationReport {
    /// Returns true if the rollback stopped early.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}

/// Invokes compensation for completed steps according to each step's strategy.
pub struct CompensationCoordinator<'a, E: StepExecutor + ?Sized> {
    executor: &'a E,
    clock: &'a dyn Clock,
}

impl<'a, E: StepExecutor + ?Sized> CompensationCoordinator<'a, E> {
    pub fn new(executor: &'a E, clock: &'a dyn Clock) -> Self {
        Self { executor, clock }
    }

    /// Compensates the steps named in `completion_order`, last completed first.
    ///
    /// Steps not currently `completed` are passed over. An `automatic`
    /// failure stops the rollback; steps beneath it stay completed.
    #[tracing::instrument(skip_all, fields(saga_id = %saga.id))]
    pub async fn compensate(
        &self,
        saga: &Saga,
        steps: &mut [SagaStep],
        completion_order: &[String],
    ) -> Result<CompensationReport> {
        let mut report = CompensationReport::default();

        for name in completion_order.iter().rev() {
            let Some(step) = steps.iter_mut().find(|step| &step.name == name) else {
                continue;
            };
            if step.status() != StepStatus::Completed {
                continue;
            }
            report.processed.push(name.clone());

            match step.configuration.compensation_strategy {
                CompensationStrategy::None => {
                    report.untouched.push(name.clone());
                }
                CompensationStrategy::Manual => {
                    step.transition_to(StepStatus::Compensating, self.clock.now())?;
                    info!(step = %name, "step awaiting manual compensation");
                    report.pending_manual.push(name.clone());
                }
                strategy @ (CompensationStrategy::Automatic | CompensationStrategy::BestEffort) => {
                    step.transition_to(StepStatus::Compensating, self.clock.now())?;
                    let result = self.invoke(saga, step).await?;
                    if result.success {
                        report.compensated.push(name.clone());
                        continue;
                    }
                    let reason = result
                        .error_message
                        .clone()
                        .or(result.error_code.clone())
                        .unwrap_or_default();
                    if strategy == CompensationStrategy::BestEffort {
                        warn!(step = %name, %reason, "best-effort compensation failed, continuing");
                        report.best_effort_failures.push(name.clone());
                        continue;
                    }
                    warn!(step = %name, %reason, "compensation failed, halting rollback");
                    report.halted = Some(CompensationHalt {
                        step: name.clone(),
                        reason,
                    });
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Calls the step's compensation endpoint and records the attempt.
    ///
    /// The step must be `compensating`; it ends `compensated` or
    /// `compensation_failed`. A step without an endpoint is marked
    /// compensated without a call.
    pub async fn invoke(&self, saga: &Saga, step: &mut SagaStep) -> Result<CompensationResult> {
        let Some(endpoint) = step.configuration.compensation_endpoint.clone() else {
            let result = CompensationResult {
                timestamp: self.clock.now(),
                ..CompensationResult::success(serde_json::Value::Null)
            };
            step.record_compensation(result.clone());
            step.transition_to(StepStatus::Compensated, self.clock.now())?;
            return Ok(result);
        };

        let invocation = CompensationInvocation {
            saga_id: saga.id,
            step_name: step.name.clone(),
            service_name: step.configuration.service_name.clone(),
            endpoint,
            method: step.configuration.method.clone(),
            timeout: step.configuration.timeout,
            context: saga.context.clone(),
            step_output: step.output().cloned().unwrap_or_default(),
        };

        metrics::counter!("saga_compensations_total").increment(1);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            step.configuration.timeout,
            self.executor.compensate(invocation),
        )
        .await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => CompensationResult::failure(err.code, err.message),
            Err(_) => CompensationResult::failure(
                TIMEOUT_ERROR_CODE,
                format!(
                    "compensation timed out after {:?}",
                    step.configuration.timeout
                ),
            ),
        };
        result.timestamp = self.clock.now();
        result.duration_ms = started.elapsed().as_millis() as u64;

        step.record_compensation(result.clone());
        if result.success {
            step.transition_to(StepStatus::Compensated, self.clock.now())?;
        } else {
            metrics::counter!("saga_compensation_failures_total").increment(1);
            step.transition_to(StepStatus::CompensationFailed, self.clock.now())?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;
    use common::DefinitionId;
    use serde_json::Value;

    use crate::clock::ManualClock;
    use crate::context::SagaContext;
    use crate::executor::InMemoryStepExecutor;
    use crate::types::{ExecutionMode, ExecutionResult, RetryPolicy, SagaType, StepConfiguration};

    fn saga() -> Saga {
        Saga::new(
            DefinitionId::new(),
            1,
            "order",
            SagaType::OrderProcessing,
            ExecutionMode::Sequential,
            SagaContext::new(),
            Value::Null,
            Duration::from_secs(60),
            RetryPolicy::default(),
            Utc::now(),
        )
    }

    fn completed_step(
        saga: &Saga,
        index: usize,
        name: &str,
        strategy: CompensationStrategy,
    ) -> SagaStep {
        let mut step = SagaStep::new(
            saga.id,
            name,
            index,
            StepConfiguration {
                service_name: "svc".into(),
                endpoint: format!("/{name}"),
                method: "POST".into(),
                timeout: Duration::from_secs(1),
                retry_policy: None,
                compensation_strategy: strategy,
                compensation_endpoint: strategy
                    .calls_endpoint()
                    .then(|| format!("/{name}/undo")),
                dependencies: Vec::new(),
                conditions: BTreeMap::new(),
                metadata: BTreeMap::new(),
            },
        );
        step.transition_to(StepStatus::Running, Utc::now()).unwrap();
        step.record_execution(ExecutionResult::success(Value::Null));
        step.transition_to(StepStatus::Completed, Utc::now()).unwrap();
        step
    }

    fn order(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_reverse_completion_order() {
        let saga = saga();
        let executor = InMemoryStepExecutor::new();
        let clock = ManualClock::default();
        let mut steps = vec![
            completed_step(&saga, 0, "A", CompensationStrategy::Automatic),
            completed_step(&saga, 1, "B", CompensationStrategy::Automatic),
            completed_step(&saga, 2, "C", CompensationStrategy::Automatic),
        ];

        // Completion order differs from definition order.
        let report = CompensationCoordinator::new(&executor, &clock)
            .compensate(&saga, &mut steps, &order(&["B", "A", "C"]))
            .await
            .unwrap();

        assert_eq!(executor.compensations(), vec!["C", "A", "B"]);
        assert_eq!(report.processed, vec!["C", "A", "B"]);
        assert!(!report.is_halted());
        assert!(steps.iter().all(|s| s.status() == StepStatus::Compensated));
    }

    #[tokio::test]
    async fn test_none_strategy_is_never_called() {
        let saga = saga();
        let executor = InMemoryStepExecutor::new();
        let clock = ManualClock::default();
        let mut steps = vec![
            completed_step(&saga, 0, "read", CompensationStrategy::None),
            completed_step(&saga, 1, "write", CompensationStrategy::Automatic),
        ];

        let report = CompensationCoordinator::new(&executor, &clock)
            .compensate(&saga, &mut steps, &order(&["read", "write"]))
            .await
            .unwrap();

        assert_eq!(executor.compensations(), vec!["write"]);
        assert_eq!(report.untouched, vec!["read"]);
        assert_eq!(steps[0].status(), StepStatus::Completed);
        assert!(steps[0].compensation_results().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues() {
        let saga = saga();
        let executor = InMemoryStepExecutor::new();
        executor.fail_compensation("B", "LEDGER_LOCKED");
        let clock = ManualClock::default();
        let mut steps = vec![
            completed_step(&saga, 0, "A", CompensationStrategy::Automatic),
            completed_step(&saga, 1, "B", CompensationStrategy::BestEffort),
            completed_step(&saga, 2, "C", CompensationStrategy::Automatic),
        ];

        let report = CompensationCoordinator::new(&executor, &clock)
            .compensate(&saga, &mut steps, &order(&["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(executor.compensations(), vec!["C", "B", "A"]);
        assert_eq!(report.best_effort_failures, vec!["B"]);
        assert_eq!(report.compensated, vec!["C", "A"]);
        assert_eq!(steps[1].status(), StepStatus::CompensationFailed);
        assert!(!steps[1].compensation_results()[0].success);
        assert_eq!(steps[0].status(), StepStatus::Compensated);
    }

    #[tokio::test]
    async fn test_automatic_failure_halts() {
        let saga = saga();
        let executor = InMemoryStepExecutor::new();
        executor.fail_compensation("B", "LEDGER_LOCKED");
        let clock = ManualClock::default();
        let mut steps = vec![
            completed_step(&saga, 0, "A", CompensationStrategy::Automatic),
            completed_step(&saga, 1, "B", CompensationStrategy::Automatic),
            completed_step(&saga, 2, "C", CompensationStrategy::Automatic),
        ];

        let report = CompensationCoordinator::new(&executor, &clock)
            .compensate(&saga, &mut steps, &order(&["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(executor.compensations(), vec!["C", "B"]);
        assert_eq!(
            report.halted.as_ref().map(|h| h.step.as_str()),
            Some("B")
        );
        assert_eq!(steps[0].status(), StepStatus::Completed);
        assert_eq!(steps[1].status(), StepStatus::CompensationFailed);
        assert_eq!(steps[2].status(), StepStatus::Compensated);
    }

    #[tokio::test]
    async fn test_manual_strategy_waits_for_operator() {
        let saga = saga();
        let executor = InMemoryStepExecutor::new();
        let clock = ManualClock::default();
        let mut steps = vec![
            completed_step(&saga, 0, "A", CompensationStrategy::Automatic),
            completed_step(&saga, 1, "kyc", CompensationStrategy::Manual),
        ];

        let report = CompensationCoordinator::new(&executor, &clock)
            .compensate(&saga, &mut steps, &order(&["A", "kyc"]))
            .await
            .unwrap();

        assert_eq!(executor.compensations(), vec!["A"]);
        assert_eq!(report.pending_manual, vec!["kyc"]);
        assert_eq!(steps[1].status(), StepStatus::Compensating);
        assert_eq!(steps[0].status(), StepStatus::Compensated);
    }
}
