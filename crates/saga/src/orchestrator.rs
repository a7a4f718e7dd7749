//! Saga orchestrator: drives sagas from creation to a terminal status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use common::SagaId;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregate::{Saga, SagaStep};
use crate::clock::Clock;
use crate::compensation::{CompensationCoordinator, CompensationReport};
use crate::condition::ConditionEvaluator;
use crate::context::SagaContext;
use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::executor::{StepExecutor, StepInvocation};
use crate::planner::ExecutionPlanner;
use crate::publisher::EventPublisher;
use crate::registry::DefinitionRegistry;
use crate::repository::SagaRepository;
use crate::retry::RetryScheduler;
use crate::state::{SagaStatus, StepStatus};
use crate::types::{
    CANCELLED_ERROR_CODE, EXECUTOR_PANIC_ERROR_CODE, ExecutionResult, SAGA_EXPIRED_ERROR_CODE,
    SagaType, TIMEOUT_ERROR_CODE,
};

/// A saga together with its steps, as returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SagaStatusView {
    pub saga: Saga,
    pub steps: Vec<SagaStep>,
}

#[derive(Debug, Default)]
struct RunLease {
    cancel_reason: Option<String>,
}

type Leases = Arc<Mutex<HashMap<SagaId, RunLease>>>;

/// Releases a saga's run lease when dropped.
struct LeaseGuard {
    leases: Leases,
    saga_id: SagaId,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.saga_id);
    }
}

enum LevelOutcome {
    Completed,
    Failed(String),
    Cancelled(String),
    Expired,
}

/// Orchestrates saga execution over pluggable collaborators.
///
/// Steps within a level run concurrently; levels run in order. Only one
/// run (or cancellation, or manual compensation) drives a given saga at a
/// time within this process.
pub struct Orchestrator<R, E, P>
where
    R: SagaRepository,
    E: StepExecutor + 'static,
    P: EventPublisher,
{
    repository: R,
    executor: Arc<E>,
    publisher: P,
    clock: Arc<dyn Clock>,
    registry: DefinitionRegistry,
    leases: Leases,
}

impl<R, E, P> Orchestrator<R, E, P>
where
    R: SagaRepository,
    E: StepExecutor + 'static,
    P: EventPublisher,
{
    /// Creates an orchestrator with an empty definition registry.
    pub fn new(repository: R, executor: Arc<E>, publisher: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            executor,
            publisher,
            clock,
            registry: DefinitionRegistry::new(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Uses a shared registry instead of a private one.
    pub fn with_registry(mut self, registry: DefinitionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// Validates and stores a definition as the next version of its type.
    pub async fn register_definition(
        &self,
        definition: SagaDefinition,
    ) -> Result<Arc<SagaDefinition>> {
        self.registry.register(definition).await
    }

    /// Latest version of every registered saga type.
    pub async fn list_definitions(&self) -> Vec<Arc<SagaDefinition>> {
        self.registry.list().await
    }

    /// Looks up a definition version, or the latest one when `version` is `None`.
    pub async fn get_definition(
        &self,
        saga_type: SagaType,
        version: Option<u32>,
    ) -> Result<Arc<SagaDefinition>> {
        let found = match version {
            Some(version) => self.registry.get(saga_type, version).await,
            None => self.registry.latest(saga_type).await,
        };
        found.ok_or_else(|| {
            SagaError::DefinitionNotFound(match version {
                Some(version) => format!("{saga_type} v{version}"),
                None => saga_type.to_string(),
            })
        })
    }

    /// Instantiates and persists a saga from the latest definition of its type.
    ///
    /// The plan is checked before anything is written.
    #[tracing::instrument(skip_all, fields(saga_type = %saga_type))]
    pub async fn create_saga(
        &self,
        saga_type: SagaType,
        mut context: SagaContext,
        input: Value,
    ) -> Result<Saga> {
        let definition = self.get_definition(saga_type, None).await?;
        if context.correlation_id.as_deref().is_none_or(str::is_empty) {
            context.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        }

        let now = self.clock.now();
        let (saga, steps) = definition.instantiate(context, input, now);
        ExecutionPlanner::plan(&steps, saga.execution_mode)?;

        self.repository.create_saga(&saga).await?;
        for step in &steps {
            self.repository.create_step(step).await?;
        }
        info!(
            saga_id = %saga.id,
            version = saga.definition_version,
            steps = steps.len(),
            "saga created"
        );
        self.publish(SagaEvent::saga_created(&saga, now)).await;
        Ok(saga)
    }

    /// Drives a created saga to a terminal status and returns it.
    ///
    /// Step failures, expiry and cancellation end the saga in the matching
    /// status and are not errors. Fails with `AlreadyRunning` if another
    /// run holds the saga.
    #[tracing::instrument(skip_all, fields(saga_id = %saga_id))]
    pub async fn run_saga(&self, saga_id: SagaId) -> Result<Saga> {
        let _lease = self.acquire(saga_id)?;
        let mut saga = self.load_saga(saga_id).await?;
        if saga.status() != SagaStatus::Created {
            return Err(SagaError::InvalidState {
                expected: SagaStatus::Created.to_string(),
                actual: saga.status().to_string(),
            });
        }
        let mut steps = self.repository.get_steps_by_saga(saga_id).await?;

        let started = Instant::now();
        self.drive(&mut saga, &mut steps).await?;
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());

        info!(status = %saga.status(), "saga run finished");
        Ok(saga)
    }

    /// Creates a saga and runs it to a terminal status.
    pub async fn start_saga(
        &self,
        saga_type: SagaType,
        context: SagaContext,
        input: Value,
    ) -> Result<Saga> {
        let saga = self.create_saga(saga_type, context, input).await?;
        self.run_saga(saga.id).await
    }

    /// Returns the stored saga and its steps.
    pub async fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaStatusView> {
        let saga = self.load_saga(saga_id).await?;
        let steps = self.repository.get_steps_by_saga(saga_id).await?;
        Ok(SagaStatusView { saga, steps })
    }

    /// Cancels a created or running saga.
    ///
    /// If a run is driving the saga, the request is handed to it and the
    /// current snapshot is returned; the run stops after its current level
    /// and compensates. Otherwise the saga is cancelled here.
    #[tracing::instrument(skip_all, fields(saga_id = %saga_id))]
    pub async fn cancel_saga(&self, saga_id: SagaId, reason: impl Into<String>) -> Result<Saga> {
        let reason = reason.into();
        let saga = self.load_saga(saga_id).await?;
        ensure_cancellable(&saga)?;

        let lease = {
            let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
            match leases.get_mut(&saga_id) {
                Some(lease) => {
                    lease.cancel_reason = Some(reason.clone());
                    None
                }
                None => {
                    leases.insert(saga_id, RunLease::default());
                    Some(LeaseGuard {
                        leases: Arc::clone(&self.leases),
                        saga_id,
                    })
                }
            }
        };
        let Some(_lease) = lease else {
            info!(%reason, "cancellation handed to active run");
            return Ok(saga);
        };

        let mut saga = self.load_saga(saga_id).await?;
        ensure_cancellable(&saga)?;
        let mut steps = self.repository.get_steps_by_saga(saga_id).await?;
        self.cancel_in_place(&mut saga, &mut steps, reason).await?;
        Ok(saga)
    }

    /// Resolves a step left in `compensating` or `compensation_failed`.
    ///
    /// Calls the step's compensation endpoint if it has one; otherwise the
    /// operator's word is taken and the step is marked compensated. If the
    /// saga had halted in `compensation_failed`, the rollback resumes for
    /// the remaining completed steps.
    #[tracing::instrument(skip_all, fields(saga_id = %saga_id, step = step_name))]
    pub async fn trigger_manual_compensation(
        &self,
        saga_id: SagaId,
        step_name: &str,
    ) -> Result<SagaStatusView> {
        let _lease = self.acquire(saga_id)?;
        let mut saga = self.load_saga(saga_id).await?;
        if !matches!(
            saga.status(),
            SagaStatus::Compensating
                | SagaStatus::Compensated
                | SagaStatus::Cancelled
                | SagaStatus::CompensationFailed
        ) {
            return Err(SagaError::InvalidState {
                expected: "compensating, compensated, cancelled or compensation_failed".to_string(),
                actual: saga.status().to_string(),
            });
        }

        let mut steps = self.repository.get_steps_by_saga(saga_id).await?;
        let step = steps
            .iter_mut()
            .find(|step| step.name == step_name)
            .ok_or_else(|| SagaError::StepNotFound {
                saga_id,
                step: step_name.to_string(),
            })?;
        match step.status() {
            StepStatus::Compensating => {}
            StepStatus::CompensationFailed => {
                step.transition_to(StepStatus::Compensating, self.clock.now())?;
            }
            other => {
                return Err(SagaError::InvalidState {
                    expected: "compensating or compensation_failed".to_string(),
                    actual: other.to_string(),
                });
            }
        }

        let coordinator = CompensationCoordinator::new(self.executor.as_ref(), self.clock.as_ref());
        let result = coordinator.invoke(&saga, step).await?;
        self.repository.update_step(step).await?;
        self.publish_step(&saga, step).await;

        if !result.success {
            let reason = result
                .error_message
                .or(result.error_code)
                .unwrap_or_default();
            warn!(step = step_name, %reason, "manual compensation failed");
            return Err(SagaError::Compensation {
                step: step_name.to_string(),
                reason,
            });
        }
        info!(step = step_name, "manual compensation succeeded");

        if saga.status() == SagaStatus::CompensationFailed {
            let outcome = if saga.cancellation_reason.is_some() {
                SagaStatus::Cancelled
            } else {
                SagaStatus::Compensated
            };
            self.roll_back(
                &mut saga,
                &mut steps,
                "resuming compensation after manual intervention",
                outcome,
            )
            .await?;
        }
        Ok(SagaStatusView { saga, steps })
    }

    fn acquire(&self, saga_id: SagaId) -> Result<LeaseGuard> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.contains_key(&saga_id) {
            return Err(SagaError::AlreadyRunning(saga_id));
        }
        leases.insert(saga_id, RunLease::default());
        Ok(LeaseGuard {
            leases: Arc::clone(&self.leases),
            saga_id,
        })
    }

    fn cancel_requested(&self, saga_id: SagaId) -> Option<String> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&saga_id)
            .and_then(|lease| lease.cancel_reason.clone())
    }

    async fn load_saga(&self, saga_id: SagaId) -> Result<Saga> {
        self.repository
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    async fn publish(&self, event: SagaEvent) {
        if let Err(err) = self.publisher.publish(event).await {
            warn!(error = %err, "failed to publish saga event");
        }
    }

    async fn publish_step(&self, saga: &Saga, step: &SagaStep) {
        if let Some(event) = SagaEvent::for_step(saga, step, self.clock.now()) {
            self.publish(event).await;
        }
    }

    async fn drive(&self, saga: &mut Saga, steps: &mut [SagaStep]) -> Result<()> {
        let levels = ExecutionPlanner::plan(steps, saga.execution_mode)?;

        let now = self.clock.now();
        saga.transition_to(SagaStatus::Running, now)?;
        self.repository.update_saga(saga).await?;
        metrics::counter!("saga_started_total", "saga_type" => saga.saga_type.as_str())
            .increment(1);
        info!(levels = levels.len(), mode = %saga.execution_mode, "saga started");
        self.publish(SagaEvent::saga_started(saga, now)).await;

        for (level_index, level) in levels.iter().enumerate() {
            saga.current_step_index = level_index;
            if let Some(reason) = self.cancel_requested(saga.id) {
                return self.cancel_in_place(saga, steps, reason).await;
            }
            if saga.is_expired(self.clock.now()) {
                return self.expire(saga, steps).await;
            }

            let mut runnable = Vec::with_capacity(level.len());
            for &index in level {
                let step = &mut steps[index];
                let conditions = &step.configuration.conditions;
                if !ConditionEvaluator::should_execute(conditions, &saga.context) {
                    let key = ConditionEvaluator::first_mismatch(conditions, &saga.context);
                    debug!(step = %step.name, condition = ?key, "conditions not met, skipping step");
                    step.transition_to(StepStatus::Skipped, self.clock.now())?;
                    self.repository.update_step(step).await?;
                    self.publish_step(saga, step).await;
                } else {
                    runnable.push(index);
                }
            }

            match self.run_level(saga, steps, runnable).await? {
                LevelOutcome::Completed => self.repository.update_saga(saga).await?,
                LevelOutcome::Failed(reason) => return self.fail(saga, steps, reason).await,
                LevelOutcome::Cancelled(reason) => {
                    return self.cancel_in_place(saga, steps, reason).await;
                }
                LevelOutcome::Expired => return self.expire(saga, steps).await,
            }
        }

        saga.current_step_index = levels.len();
        let now = self.clock.now();
        saga.transition_to(SagaStatus::Completed, now)?;
        self.repository.update_saga(saga).await?;
        metrics::counter!("saga_completed_total", "saga_type" => saga.saga_type.as_str())
            .increment(1);
        info!("saga completed");
        self.publish(SagaEvent::saga_completed(saga, now)).await;
        Ok(())
    }

    /// Runs one level to completion, retrying failed steps as their policies allow.
    async fn run_level(
        &self,
        saga: &mut Saga,
        steps: &mut [SagaStep],
        mut pending: Vec<usize>,
    ) -> Result<LevelOutcome> {
        while !pending.is_empty() {
            let results = self.dispatch(saga, steps, &pending).await?;
            let mut retries: Vec<(usize, Duration)> = Vec::new();
            let mut failure: Option<String> = None;

            for (index, result) in results {
                let now = self.clock.now();
                let step = &mut steps[index];
                step.record_execution(result.clone());

                if result.success {
                    step.transition_to(StepStatus::Completed, now)?;
                    saga.record_step_completed(&step.name, result.output);
                    info!(step = %step.name, attempt = result.attempt, "step completed");
                } else {
                    let code = result.error_code.unwrap_or_default();
                    let policy = step
                        .configuration
                        .retry_policy
                        .clone()
                        .unwrap_or_else(|| saga.retry_policy.clone());
                    let expired = saga.is_expired(now);

                    if policy.is_retryable(&code)
                        && RetryScheduler::can_retry(step.retry_count, &policy, expired)
                    {
                        let delay = RetryScheduler::next_retry_delay(step.retry_count, &policy);
                        step.transition_to(StepStatus::Retrying, now)?;
                        step.retry_count += 1;
                        saga.record_retry(format!("{}: {code}", step.name), now);
                        metrics::counter!("saga_step_retries_total").increment(1);
                        debug!(
                            step = %step.name,
                            retry = step.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %code,
                            "step retry scheduled"
                        );
                        retries.push((index, delay));
                    } else {
                        let status = if code == TIMEOUT_ERROR_CODE {
                            StepStatus::Timeout
                        } else {
                            StepStatus::Failed
                        };
                        step.transition_to(status, now)?;
                        let error = step.last_error.clone().unwrap_or(code);
                        warn!(step = %step.name, %error, attempts = step.attempts(), "step failed");
                        failure.get_or_insert_with(|| {
                            format!("step '{}' failed: {error}", step.name)
                        });
                    }
                }

                self.repository.update_step(step).await?;
                self.publish_step(saga, step).await;
            }

            if let Some(reason) = failure {
                self.abandon_retries(saga, steps, &retries, &reason).await?;
                return Ok(LevelOutcome::Failed(reason));
            }
            if retries.is_empty() {
                break;
            }
            if let Some(reason) = self.cancel_requested(saga.id) {
                self.abandon_retries(saga, steps, &retries, CANCELLED_ERROR_CODE)
                    .await?;
                return Ok(LevelOutcome::Cancelled(reason));
            }

            self.repository.update_saga(saga).await?;
            let delay = retries
                .iter()
                .map(|(_, delay)| *delay)
                .max()
                .unwrap_or_default();
            self.clock.sleep(delay).await;

            if saga.is_expired(self.clock.now()) {
                self.abandon_retries(saga, steps, &retries, SAGA_EXPIRED_ERROR_CODE)
                    .await?;
                return Ok(LevelOutcome::Expired);
            }
            if let Some(reason) = self.cancel_requested(saga.id) {
                self.abandon_retries(saga, steps, &retries, CANCELLED_ERROR_CODE)
                    .await?;
                return Ok(LevelOutcome::Cancelled(reason));
            }
            pending = retries.into_iter().map(|(index, _)| index).collect();
        }
        Ok(LevelOutcome::Completed)
    }

    /// Runs the given steps concurrently and returns their results in the
    /// order the calls finished.
    async fn dispatch(
        &self,
        saga: &Saga,
        steps: &mut [SagaStep],
        indices: &[usize],
    ) -> Result<Vec<(usize, ExecutionResult)>> {
        let finish_order = Arc::new(AtomicUsize::new(0));
        let mut calls = Vec::with_capacity(indices.len());
        let mut handles = Vec::with_capacity(indices.len());

        // Every step is persisted as running before any call starts, so a
        // storage error never leaves a spawned call behind.
        let mut invocations = Vec::with_capacity(indices.len());
        for &index in indices {
            let now = self.clock.now();
            let step = &mut steps[index];
            step.transition_to(StepStatus::Running, now)?;
            self.repository.update_step(step).await?;

            let timeout = saga
                .remaining(now)
                .map_or(step.configuration.timeout, |remaining| {
                    remaining.min(step.configuration.timeout)
                });
            let attempt = step.attempts() + 1;
            debug!(step = %step.name, attempt, ?timeout, "dispatching step");
            invocations.push(StepInvocation {
                saga_id: saga.id,
                step_name: step.name.clone(),
                attempt,
                configuration: step.configuration.clone(),
                timeout,
                context: saga.context.clone(),
                input: saga.input_data.clone(),
                output: saga.output_data.clone(),
            });
            calls.push((index, attempt, timeout));
        }

        for invocation in invocations {
            let executor = Arc::clone(&self.executor);
            let finish_order = Arc::clone(&finish_order);
            let timeout = invocation.timeout;
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, executor.execute(invocation)).await;
                (
                    outcome,
                    started.elapsed(),
                    finish_order.fetch_add(1, Ordering::SeqCst),
                )
            }));
        }

        let mut results = Vec::with_capacity(calls.len());
        for ((index, attempt, timeout), joined) in calls.into_iter().zip(join_all(handles).await) {
            let (mut result, elapsed, finished) = match joined {
                Ok((Ok(Ok(result)), elapsed, finished)) => (result, elapsed, finished),
                Ok((Ok(Err(err)), elapsed, finished)) => (
                    ExecutionResult::failure(err.code, err.message),
                    elapsed,
                    finished,
                ),
                Ok((Err(_), elapsed, finished)) => (
                    ExecutionResult::failure(
                        TIMEOUT_ERROR_CODE,
                        format!("step timed out after {timeout:?}"),
                    ),
                    elapsed,
                    finished,
                ),
                Err(err) => (
                    ExecutionResult::failure(
                        EXECUTOR_PANIC_ERROR_CODE,
                        format!("step executor panicked: {err}"),
                    ),
                    Duration::ZERO,
                    usize::MAX,
                ),
            };
            result.attempt = attempt;
            result.timestamp = self.clock.now();
            result.duration_ms = elapsed.as_millis() as u64;
            results.push((finished, index, result));
        }

        results.sort_by_key(|(finished, index, _)| (*finished, *index));
        Ok(results
            .into_iter()
            .map(|(_, index, result)| (index, result))
            .collect())
    }

    /// Fails steps whose scheduled retry will not happen.
    async fn abandon_retries(
        &self,
        saga: &Saga,
        steps: &mut [SagaStep],
        retries: &[(usize, Duration)],
        reason: &str,
    ) -> Result<()> {
        for &(index, _) in retries {
            let step = &mut steps[index];
            step.last_error = Some(reason.to_string());
            step.transition_to(StepStatus::Failed, self.clock.now())?;
            self.repository.update_step(step).await?;
            self.publish_step(saga, step).await;
        }
        Ok(())
    }

    async fn fail(&self, saga: &mut Saga, steps: &mut [SagaStep], reason: String) -> Result<()> {
        let now = self.clock.now();
        saga.last_error = Some(reason.clone());
        saga.transition_to(SagaStatus::Failed, now)?;
        self.repository.update_saga(saga).await?;
        metrics::counter!("saga_failed_total", "saga_type" => saga.saga_type.as_str())
            .increment(1);
        warn!(%reason, completed = saga.completed_steps.len(), "saga failed");
        self.publish(SagaEvent::saga_failed(saga, &reason, now)).await;

        if saga.completed_steps.is_empty() {
            return Ok(());
        }
        self.roll_back(saga, steps, &reason, SagaStatus::Compensated)
            .await
    }

    async fn expire(&self, saga: &mut Saga, steps: &mut [SagaStep]) -> Result<()> {
        let now = self.clock.now();
        saga.last_error = Some("saga expired".to_string());
        metrics::counter!("saga_failed_total", "saga_type" => saga.saga_type.as_str())
            .increment(1);
        warn!(completed = saga.completed_steps.len(), "saga expired");

        if saga.completed_steps.is_empty() {
            saga.transition_to(SagaStatus::Timeout, now)?;
            self.repository.update_saga(saga).await?;
            self.publish(SagaEvent::saga_timed_out(saga, now)).await;
            return Ok(());
        }
        saga.expired_at = Some(now);
        self.publish(SagaEvent::saga_timed_out(saga, now)).await;
        self.roll_back(saga, steps, "saga expired", SagaStatus::Compensated)
            .await
    }

    async fn cancel_in_place(
        &self,
        saga: &mut Saga,
        steps: &mut [SagaStep],
        reason: String,
    ) -> Result<()> {
        saga.cancellation_reason = Some(reason.clone());
        info!(%reason, completed = saga.completed_steps.len(), "cancelling saga");

        if saga.completed_steps.is_empty() {
            let now = self.clock.now();
            saga.transition_to(SagaStatus::Cancelled, now)?;
            self.repository.update_saga(saga).await?;
            metrics::counter!("saga_cancelled_total", "saga_type" => saga.saga_type.as_str())
                .increment(1);
            self.publish(SagaEvent::saga_cancelled(saga, reason, now))
                .await;
            return Ok(());
        }
        self.roll_back(saga, steps, &reason, SagaStatus::Cancelled)
            .await
    }

    /// Compensates completed steps, then settles the saga in `outcome`, or in
    /// `compensation_failed` if the rollback halted.
    async fn roll_back(
        &self,
        saga: &mut Saga,
        steps: &mut [SagaStep],
        reason: &str,
        outcome: SagaStatus,
    ) -> Result<()> {
        let now = self.clock.now();
        saga.transition_to(SagaStatus::Compensating, now)?;
        self.repository.update_saga(saga).await?;
        self.publish(SagaEvent::saga_compensating(saga, reason, now))
            .await;

        let completion_order = saga.completed_steps.clone();
        let report = CompensationCoordinator::new(self.executor.as_ref(), self.clock.as_ref())
            .compensate(saga, steps, &completion_order)
            .await?;
        self.settle(saga, steps, &report, outcome).await
    }

    async fn settle(
        &self,
        saga: &mut Saga,
        steps: &[SagaStep],
        report: &CompensationReport,
        outcome: SagaStatus,
    ) -> Result<()> {
        for name in &report.processed {
            if let Some(step) = steps.iter().find(|step| &step.name == name)
                && step.status() != StepStatus::Completed
            {
                self.repository.update_step(step).await?;
                self.publish_step(saga, step).await;
            }
        }

        let now = self.clock.now();
        if let Some(halt) = &report.halted {
            saga.last_error = Some(format!(
                "compensation of step '{}' failed: {}",
                halt.step, halt.reason
            ));
            saga.transition_to(SagaStatus::CompensationFailed, now)?;
            self.repository.update_saga(saga).await?;
            warn!(step = %halt.step, reason = %halt.reason, "saga compensation halted");
            self.publish(SagaEvent::saga_compensation_failed(
                saga,
                &halt.reason,
                now,
            ))
            .await;
            return Ok(());
        }

        if !report.pending_manual.is_empty() {
            info!(steps = ?report.pending_manual, "steps awaiting manual compensation");
        }
        saga.transition_to(outcome, now)?;
        self.repository.update_saga(saga).await?;
        if outcome == SagaStatus::Cancelled {
            metrics::counter!("saga_cancelled_total", "saga_type" => saga.saga_type.as_str())
                .increment(1);
            let reason = saga.cancellation_reason.clone().unwrap_or_default();
            self.publish(SagaEvent::saga_cancelled(saga, reason, now))
                .await;
        } else {
            info!(compensated = report.compensated.len(), "saga compensated");
            self.publish(SagaEvent::saga_compensated(saga, now)).await;
        }
        Ok(())
    }
}

fn ensure_cancellable(saga: &Saga) -> Result<()> {
    if saga.status().can_cancel() {
        Ok(())
    } else {
        Err(SagaError::InvalidTransition {
            from: saga.status(),
            to: SagaStatus::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::definition::StepDefinition;
    use crate::executor::InMemoryStepExecutor;
    use crate::publisher::InMemoryEventPublisher;
    use crate::error::RepositoryError;
    use crate::repository::{InMemorySagaRepository, RepositoryResult};
    use crate::types::{CompensationStrategy, ExecutionMode, RetryPolicy};

    type TestOrchestrator =
        Orchestrator<InMemorySagaRepository, InMemoryStepExecutor, InMemoryEventPublisher>;

    struct Harness {
        orchestrator: TestOrchestrator,
        executor: InMemoryStepExecutor,
        publisher: InMemoryEventPublisher,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let executor = InMemoryStepExecutor::new();
        let publisher = InMemoryEventPublisher::new();
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Orchestrator::new(
            InMemorySagaRepository::new(),
            Arc::new(executor.clone()),
            publisher.clone(),
            clock.clone(),
        );
        Harness {
            orchestrator,
            executor,
            publisher,
            clock,
        }
    }

    fn undoable(name: &str) -> StepDefinition {
        StepDefinition::new(name, "svc", format!("/{name}"))
            .compensate_with(CompensationStrategy::Automatic, format!("/{name}/undo"))
    }

    fn three_steps() -> SagaDefinition {
        SagaDefinition::new("three", SagaType::OrderProcessing)
            .default_retry_policy(RetryPolicy::no_retry())
            .step(undoable("A"))
            .step(undoable("B"))
            .step(undoable("C"))
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let h = harness();
        h.orchestrator.register_definition(three_steps()).await.unwrap();

        let saga = h
            .orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.completed_steps, vec!["A", "B", "C"]);
        assert_eq!(h.executor.executions(), vec!["A", "B", "C"]);
        assert!(saga.output_data.contains_key("B"));
        assert!(!saga.correlation_id().is_empty());
        assert_eq!(
            h.publisher.event_types().await,
            vec![
                "SagaCreated",
                "SagaStarted",
                "StepCompleted",
                "StepCompleted",
                "StepCompleted",
                "SagaCompleted"
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let h = harness();
        h.orchestrator.register_definition(three_steps()).await.unwrap();
        h.executor.fail_step("C", "INSUFFICIENT_FUNDS");

        let saga = h
            .orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(h.executor.compensations(), vec!["B", "A"]);
        assert!(saga.last_error.as_deref().unwrap().contains("'C'"));

        let view = h.orchestrator.get_saga_status(saga.id).await.unwrap();
        let statuses: Vec<_> = view.steps.iter().map(|s| s.status()).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Compensated,
                StepStatus::Compensated,
                StepStatus::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_first_step_failure_leaves_saga_failed() {
        let h = harness();
        h.orchestrator.register_definition(three_steps()).await.unwrap();
        h.executor.fail_step("A", "INVALID_INPUT");

        let saga = h
            .orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(h.executor.compensations().is_empty());
        assert_eq!(h.executor.attempts("B"), 0);
    }

    #[tokio::test]
    async fn test_unknown_saga_type() {
        let h = harness();
        let err = h
            .orchestrator
            .create_saga(SagaType::RefundProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_requires_created_saga() {
        let h = harness();
        h.orchestrator.register_definition(three_steps()).await.unwrap();
        let saga = h
            .orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        let err = h.orchestrator.run_saga(saga.id).await.unwrap_err();
        assert!(matches!(err, SagaError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_publisher_failure_does_not_change_outcome() {
        let h = harness();
        h.publisher.set_fail(true).await;
        h.orchestrator.register_definition(three_steps()).await.unwrap();

        let saga = h
            .orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert!(h.publisher.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_created_saga() {
        let h = harness();
        h.orchestrator.register_definition(three_steps()).await.unwrap();
        let saga = h
            .orchestrator
            .create_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        let cancelled = h.orchestrator.cancel_saga(saga.id, "customer request").await.unwrap();

        assert_eq!(cancelled.status(), SagaStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("customer request"));
        assert!(h.executor.executions().is_empty());

        let err = h.orchestrator.cancel_saga(saga.id, "again").await.unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_retry_sleeps_through_clock() {
        let h = harness();
        let policy = RetryPolicy {
            max_retries: 3,
            interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(60),
            retry_on: vec!["SERVICE_UNAVAILABLE".to_string()],
        };
        h.orchestrator
            .register_definition(
                SagaDefinition::new("flaky", SagaType::PaymentProcessing)
                    .execution_mode(ExecutionMode::Sequential)
                    .step(
                        StepDefinition::new("charge", "payments", "/charge").retry_policy(policy),
                    ),
            )
            .await
            .unwrap();
        h.executor.fail_step_times("charge", 2, "SERVICE_UNAVAILABLE");

        let saga = h
            .orchestrator
            .start_saga(SagaType::PaymentProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.retry_count, 2);
        assert_eq!(h.executor.attempts("charge"), 3);

        let sleeps = h.clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert_eq!(sleeps[0], Duration::from_secs(1));
        assert!(
            sleeps[1] >= Duration::from_millis(1500) && sleeps[1] <= Duration::from_millis(2500)
        );

        let view = h.orchestrator.get_saga_status(saga.id).await.unwrap();
        let attempts: Vec<u32> = view.steps[0]
            .execution_results()
            .iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    /// Delegates to the in-memory store but refuses to mark one step running.
    struct RejectingRepository {
        inner: InMemorySagaRepository,
        reject: &'static str,
    }

    #[async_trait::async_trait]
    impl SagaRepository for RejectingRepository {
        async fn create_saga(&self, saga: &Saga) -> RepositoryResult<()> {
            self.inner.create_saga(saga).await
        }

        async fn get_saga(&self, saga_id: SagaId) -> RepositoryResult<Option<Saga>> {
            self.inner.get_saga(saga_id).await
        }

        async fn update_saga(&self, saga: &Saga) -> RepositoryResult<()> {
            self.inner.update_saga(saga).await
        }

        async fn create_step(&self, step: &SagaStep) -> RepositoryResult<()> {
            self.inner.create_step(step).await
        }

        async fn get_steps_by_saga(&self, saga_id: SagaId) -> RepositoryResult<Vec<SagaStep>> {
            self.inner.get_steps_by_saga(saga_id).await
        }

        async fn update_step(&self, step: &SagaStep) -> RepositoryResult<()> {
            if step.name == self.reject && step.status() == StepStatus::Running {
                return Err(RepositoryError::Backend("disk full".to_string()));
            }
            self.inner.update_step(step).await
        }
    }

    #[tokio::test]
    async fn test_storage_error_before_dispatch_starts_no_calls() {
        let executor = InMemoryStepExecutor::new();
        let orchestrator = Orchestrator::new(
            RejectingRepository {
                inner: InMemorySagaRepository::new(),
                reject: "B",
            },
            Arc::new(executor.clone()),
            InMemoryEventPublisher::new(),
            Arc::new(ManualClock::default()),
        );
        orchestrator
            .register_definition(
                SagaDefinition::new("fan-out", SagaType::OrderProcessing)
                    .execution_mode(ExecutionMode::Parallel)
                    .step(undoable("A"))
                    .step(undoable("B")),
            )
            .await
            .unwrap();

        let err = orchestrator
            .start_saga(SagaType::OrderProcessing, SagaContext::new(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Repository(RepositoryError::Backend(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.executions().is_empty());
    }
}
