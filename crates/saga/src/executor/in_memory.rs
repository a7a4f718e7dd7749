//! Scriptable in-memory step executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CompensationInvocation, StepCallError, StepExecutor, StepInvocation};
use crate::types::{CompensationResult, ExecutionResult};

#[derive(Debug, Clone, Default)]
struct StepScript {
    /// Fail this many calls, then succeed.
    failures_left: Option<u32>,
    /// Fail every call.
    always_fail: bool,
    error_code: String,
    delay: Option<Duration>,
    output: Option<Value>,
    panic: bool,
}

#[derive(Debug, Default)]
struct InMemoryExecutorState {
    scripts: HashMap<String, StepScript>,
    compensation_failures: HashMap<String, String>,
    executions: Vec<String>,
    finished: Vec<String>,
    compensations: Vec<String>,
}

/// In-memory executor for testing and demos.
///
/// Every step succeeds unless scripted otherwise; calls are logged in order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepExecutor {
    state: Arc<Mutex<InMemoryExecutorState>>,
}

impl InMemoryStepExecutor {
    /// Creates an executor where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(&self, step: &str, update: impl FnOnce(&mut StepScript)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        update(state.scripts.entry(step.to_string()).or_default());
    }

    /// Makes every call to `step` fail with `code`.
    pub fn fail_step(&self, step: &str, code: &str) {
        self.with_script(step, |script| {
            script.always_fail = true;
            script.error_code = code.to_string();
        });
    }

    /// Makes the next `times` calls to `step` fail with `code`.
    pub fn fail_step_times(&self, step: &str, times: u32, code: &str) {
        self.with_script(step, |script| {
            script.failures_left = Some(times);
            script.error_code = code.to_string();
        });
    }

    /// Delays every call to `step`.
    pub fn delay_step(&self, step: &str, delay: Duration) {
        self.with_script(step, |script| script.delay = Some(delay));
    }

    /// Sets the output returned by `step`.
    pub fn set_output(&self, step: &str, output: Value) {
        self.with_script(step, |script| script.output = Some(output));
    }

    /// Makes calls to `step` panic.
    pub fn panic_on(&self, step: &str) {
        self.with_script(step, |script| script.panic = true);
    }

    /// Makes compensation of `step` fail with `code`.
    pub fn fail_compensation(&self, step: &str, code: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .compensation_failures
            .insert(step.to_string(), code.to_string());
    }

    /// Clears a scripted compensation failure.
    pub fn heal_compensation(&self, step: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.compensation_failures.remove(step);
    }

    /// Step names in the order their calls started.
    pub fn executions(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .executions
            .clone()
    }

    /// Step names in the order their calls returned.
    pub fn finished(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .clone()
    }

    /// Step names in the order compensation was invoked.
    pub fn compensations(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .compensations
            .clone()
    }

    /// Number of calls made to `step`.
    pub fn attempts(&self, step: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .executions
            .iter()
            .filter(|name| name.as_str() == step)
            .count()
    }

    /// Records the call and decides its outcome up front.
    fn begin(&self, step: &str) -> (StepScript, Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.executions.push(step.to_string());
        let script = state.scripts.entry(step.to_string()).or_default();
        let failure = if script.always_fail {
            Some(script.error_code.clone())
        } else {
            match script.failures_left {
                Some(left) if left > 0 => {
                    script.failures_left = Some(left - 1);
                    Some(script.error_code.clone())
                }
                _ => None,
            }
        };
        (script.clone(), failure)
    }
}

#[async_trait]
impl StepExecutor for InMemoryStepExecutor {
    async fn execute(&self, invocation: StepInvocation) -> Result<ExecutionResult, StepCallError> {
        let (script, failure) = self.begin(&invocation.step_name);

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if script.panic {
            panic!("scripted panic in step '{}'", invocation.step_name);
        }

        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .push(invocation.step_name.clone());

        if let Some(code) = failure {
            return Err(StepCallError::new(
                code,
                format!("{} call failed", invocation.configuration.service_name),
            ));
        }

        let output = script.output.unwrap_or_else(|| {
            json!({
                "step": invocation.step_name,
                "service": invocation.configuration.service_name,
                "attempt": invocation.attempt,
            })
        });
        Ok(ExecutionResult::success(output))
    }

    async fn compensate(
        &self,
        invocation: CompensationInvocation,
    ) -> Result<CompensationResult, StepCallError> {
        let failure = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.compensations.push(invocation.step_name.clone());
            state
                .compensation_failures
                .get(&invocation.step_name)
                .cloned()
        };

        match failure {
            Some(code) => Err(StepCallError::new(
                code,
                format!("{} rejected compensation", invocation.service_name),
            )),
            None => Ok(CompensationResult::success(
                json!({ "undone": invocation.step_name }),
            )),
        }
    }
}
