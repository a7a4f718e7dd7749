//! Saga definition registration and lookup endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use saga::{
    CompensationStrategy, ExecutionMode, RetryPolicy, SagaDefinition, SagaType, StepDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct RegisterDefinitionRequest {
    pub name: String,
    pub saga_type: SagaType,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub steps: Vec<StepRequest>,
    pub default_timeout_secs: Option<u64>,
    pub default_step_timeout_secs: Option<u64>,
    pub default_retry_policy: Option<RetryPolicyRequest>,
    pub default_compensation: Option<CompensationStrategy>,
}

#[derive(Deserialize)]
pub struct StepRequest {
    pub name: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicyRequest>,
    pub compensation_strategy: Option<CompensationStrategy>,
    pub compensation_endpoint: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub struct RetryPolicyRequest {
    pub max_retries: u32,
    pub interval_ms: u64,
    pub backoff_factor: f64,
    pub max_interval_ms: u64,
    #[serde(default)]
    pub retry_on: Vec<String>,
}

impl From<RetryPolicyRequest> for RetryPolicy {
    fn from(req: RetryPolicyRequest) -> Self {
        RetryPolicy {
            max_retries: req.max_retries,
            interval: Duration::from_millis(req.interval_ms),
            backoff_factor: req.backoff_factor,
            max_interval: Duration::from_millis(req.max_interval_ms),
            retry_on: req.retry_on,
        }
    }
}

impl From<StepRequest> for StepDefinition {
    fn from(req: StepRequest) -> Self {
        let mut step = StepDefinition::new(req.name, req.service_name, req.endpoint);
        if let Some(method) = req.method {
            step = step.method(method);
        }
        if let Some(timeout_ms) = req.timeout_ms {
            step = step.timeout(Duration::from_millis(timeout_ms));
        }
        step.retry_policy = req.retry_policy.map(RetryPolicy::from);
        step.compensation_strategy = req.compensation_strategy;
        step.compensation_endpoint = req.compensation_endpoint;
        step.dependencies = req.dependencies;
        step.conditions = req.conditions;
        step.metadata = req.metadata;
        step
    }
}

#[derive(Deserialize)]
pub struct VersionQuery {
    pub version: Option<u32>,
}

// -- Response types --

#[derive(Serialize)]
pub struct DefinitionSummary {
    pub id: String,
    pub name: String,
    pub saga_type: SagaType,
    pub version: u32,
    pub execution_mode: ExecutionMode,
    pub steps: Vec<String>,
}

impl From<&SagaDefinition> for DefinitionSummary {
    fn from(definition: &SagaDefinition) -> Self {
        Self {
            id: definition.id.to_string(),
            name: definition.name.clone(),
            saga_type: definition.saga_type,
            version: definition.version,
            execution_mode: definition.execution_mode,
            steps: definition.steps.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

// -- Handlers --

/// POST /definitions — validate and register a new definition version.
#[tracing::instrument(skip(state, req), fields(saga_type = %req.saga_type))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterDefinitionRequest>,
) -> Result<(StatusCode, Json<DefinitionSummary>), ApiError> {
    let config = &state.engine_config;
    let mut definition = config
        .definition(req.name, req.saga_type)
        .execution_mode(req.execution_mode);
    if let Some(secs) = req.default_timeout_secs {
        definition = definition.default_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = req.default_step_timeout_secs {
        definition = definition.default_step_timeout(Duration::from_secs(secs));
    }
    if let Some(policy) = req.default_retry_policy {
        definition = definition.default_retry_policy(policy.into());
    }
    if let Some(strategy) = req.default_compensation {
        definition = definition.default_compensation(strategy);
    }
    for step in req.steps {
        definition = definition.step(step.into());
    }

    let registered = state.orchestrator.register_definition(definition).await?;
    Ok((
        StatusCode::CREATED,
        Json(DefinitionSummary::from(registered.as_ref())),
    ))
}

/// GET /definitions — latest version of every registered saga type.
#[tracing::instrument(skip(state))]
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<DefinitionSummary>> {
    let definitions = state.orchestrator.list_definitions().await;
    Json(
        definitions
            .iter()
            .map(|definition| DefinitionSummary::from(definition.as_ref()))
            .collect(),
    )
}

/// GET /definitions/{saga_type}?version=N — the full definition.
#[tracing::instrument(skip(state, query))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(saga_type): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<SagaDefinition>, ApiError> {
    let saga_type: SagaType = saga_type
        .parse()
        .map_err(|e: saga::types::UnknownSagaType| ApiError::BadRequest(e.to_string()))?;
    let definition = state
        .orchestrator
        .get_definition(saga_type, query.version)
        .await?;
    Ok(Json(definition.as_ref().clone()))
}
