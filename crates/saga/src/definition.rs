//! Reusable saga blueprints.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::DefinitionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::{Saga, SagaStep};
use crate::context::SagaContext;
use crate::error::ValidationError;
use crate::planner::ExecutionPlanner;
use crate::types::{
    CompensationStrategy, ExecutionMode, RetryPolicy, SagaType, StepConfiguration,
};

/// Blueprint for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub service_name: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Falls back to the definition's default step timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Falls back to the definition's default strategy.
    #[serde(default)]
    pub compensation_strategy: Option<CompensationStrategy>,
    #[serde(default)]
    pub compensation_endpoint: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl StepDefinition {
    /// Creates a step calling `endpoint` on `service_name`.
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            method: default_method(),
            timeout: None,
            retry_policy: None,
            compensation_strategy: None,
            compensation_endpoint: None,
            dependencies: Vec::new(),
            conditions: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the compensation strategy and the endpoint it calls.
    pub fn compensate_with(
        mut self,
        strategy: CompensationStrategy,
        endpoint: impl Into<String>,
    ) -> Self {
        self.compensation_strategy = Some(strategy);
        self.compensation_endpoint = Some(endpoint.into());
        self
    }

    /// Sets a compensation strategy that needs no endpoint (`none`, `manual`).
    pub fn compensation(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation_strategy = Some(strategy);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn condition(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Versioned blueprint from which saga instances are stamped out.
///
/// Registered definitions are immutable; a change is a new version and
/// running instances keep the step configuration they were created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    #[serde(default)]
    pub id: DefinitionId,
    pub name: String,
    pub saga_type: SagaType,
    /// Assigned by the registry.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_saga_timeout")]
    pub default_timeout: Duration,
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout: Duration,
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    #[serde(default)]
    pub default_compensation: CompensationStrategy,
}

fn default_saga_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

impl SagaDefinition {
    /// Creates an empty definition with default timeouts and retry policy.
    pub fn new(name: impl Into<String>, saga_type: SagaType) -> Self {
        Self {
            id: DefinitionId::new(),
            name: name.into(),
            saga_type,
            version: 0,
            execution_mode: ExecutionMode::Sequential,
            steps: Vec::new(),
            default_timeout: default_saga_timeout(),
            default_step_timeout: default_step_timeout(),
            default_retry_policy: RetryPolicy::default(),
            default_compensation: CompensationStrategy::None,
        }
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn default_compensation(mut self, strategy: CompensationStrategy) -> Self {
        self.default_compensation = strategy;
        self
    }

    /// Checks required fields, name uniqueness, retry policies and the
    /// dependency graph (resolved and acyclic, whatever the execution mode).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }
        self.default_retry_policy.validate(&self.name)?;

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ValidationError::UnnamedStep(index));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStep(step.name.clone()));
            }
            let missing = |field| ValidationError::MissingField {
                step: step.name.clone(),
                field,
            };
            if step.service_name.trim().is_empty() {
                return Err(missing("service_name"));
            }
            if step.endpoint.trim().is_empty() {
                return Err(missing("endpoint"));
            }
            if let Some(policy) = &step.retry_policy {
                policy.validate(&step.name)?;
            }
            let strategy = step
                .compensation_strategy
                .unwrap_or(self.default_compensation);
            let has_endpoint = step
                .compensation_endpoint
                .as_deref()
                .is_some_and(|endpoint| !endpoint.trim().is_empty());
            if strategy.calls_endpoint() && !has_endpoint {
                return Err(ValidationError::MissingCompensationEndpoint {
                    step: step.name.clone(),
                    strategy: strategy.to_string(),
                });
            }
        }

        let graph: Vec<(&str, &[String])> = self
            .steps
            .iter()
            .map(|step| (step.name.as_str(), step.dependencies.as_slice()))
            .collect();
        ExecutionPlanner::dependency_levels(&graph)?;
        Ok(())
    }

    /// Stamps out a saga and its steps with every default resolved and frozen.
    pub fn instantiate(
        &self,
        context: SagaContext,
        input_data: Value,
        now: DateTime<Utc>,
    ) -> (Saga, Vec<SagaStep>) {
        let saga = Saga::new(
            self.id,
            self.version,
            self.name.clone(),
            self.saga_type,
            self.execution_mode,
            context,
            input_data,
            self.default_timeout,
            self.default_retry_policy.clone(),
            now,
        );
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let configuration = StepConfiguration {
                    service_name: step.service_name.clone(),
                    endpoint: step.endpoint.clone(),
                    method: step.method.clone(),
                    timeout: step.timeout.unwrap_or(self.default_step_timeout),
                    retry_policy: step.retry_policy.clone(),
                    compensation_strategy: step
                        .compensation_strategy
                        .unwrap_or(self.default_compensation),
                    compensation_endpoint: step.compensation_endpoint.clone(),
                    dependencies: step.dependencies.clone(),
                    conditions: step.conditions.clone(),
                    metadata: step.metadata.clone(),
                };
                SagaStep::new(saga.id, step.name.clone(), index, configuration)
            })
            .collect();
        (saga, steps)
    }
}
