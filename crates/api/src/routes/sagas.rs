//! Saga execution, status, cancellation and compensation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{Saga, SagaContext, SagaStatus, SagaStatusView, SagaStep, SagaType, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: SagaType,
    #[serde(default)]
    pub context: SagaContext,
    #[serde(default)]
    pub input: Value,
}

#[derive(Deserialize, Default)]
pub struct CancelSagaRequest {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub name: String,
    pub saga_type: SagaType,
    pub status: SagaStatus,
    /// No further transition will happen.
    pub terminal: bool,
    pub definition_version: u32,
    pub correlation_id: String,
    pub completed_steps: Vec<String>,
    pub output: Map<String, Value>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Saga> for SagaResponse {
    fn from(saga: &Saga) -> Self {
        Self {
            id: saga.id.to_string(),
            name: saga.name.clone(),
            saga_type: saga.saga_type,
            status: saga.status(),
            terminal: saga.status().is_terminal(),
            definition_version: saga.definition_version,
            correlation_id: saga.correlation_id().to_string(),
            completed_steps: saga.completed_steps.clone(),
            output: saga.output_data.clone(),
            retry_count: saga.retry_count,
            last_error: saga.last_error.clone(),
            cancellation_reason: saga.cancellation_reason.clone(),
            created_at: saga.created_at,
            started_at: saga.started_at,
            expires_at: saga.expires_at,
            finished_at: saga
                .completed_at
                .or(saga.compensated_at)
                .or(saga.cancelled_at)
                .or(saga.expired_at)
                .or(saga.failed_at),
        }
    }
}

#[derive(Serialize)]
pub struct StepResponse {
    pub name: String,
    pub index: usize,
    pub status: StepStatus,
    pub service_name: String,
    pub attempts: u32,
    pub retry_count: u32,
    pub compensation_attempts: usize,
    pub last_error: Option<String>,
}

impl From<&SagaStep> for StepResponse {
    fn from(step: &SagaStep) -> Self {
        Self {
            name: step.name.clone(),
            index: step.step_index,
            status: step.status(),
            service_name: step.configuration.service_name.clone(),
            attempts: step.attempts(),
            retry_count: step.retry_count,
            compensation_attempts: step.compensation_results().len(),
            last_error: step.last_error.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub saga: SagaResponse,
    pub steps: Vec<StepResponse>,
}

impl From<&SagaStatusView> for SagaStatusResponse {
    fn from(view: &SagaStatusView) -> Self {
        Self {
            saga: SagaResponse::from(&view.saga),
            steps: view.steps.iter().map(StepResponse::from).collect(),
        }
    }
}

// -- Handlers --

/// POST /sagas — create a saga from the latest definition and run it.
#[tracing::instrument(skip(state, req), fields(saga_type = %req.saga_type))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError> {
    let saga = state
        .orchestrator
        .start_saga(req.saga_type, req.context, req.input)
        .await?;
    Ok((StatusCode::CREATED, Json(SagaResponse::from(&saga))))
}

/// GET /sagas/{id} — the saga and its steps.
#[tracing::instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let view = state.orchestrator.get_saga_status(saga_id).await?;
    Ok(Json(SagaStatusResponse::from(&view)))
}

/// POST /sagas/{id}/cancel — cancel a created or running saga.
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: Option<Json<CancelSagaRequest>>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let reason = req
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled via API".to_string());
    let saga = state.orchestrator.cancel_saga(saga_id, reason).await?;
    Ok(Json(SagaResponse::from(&saga)))
}

/// POST /sagas/{id}/steps/{step}/compensate — operator-driven compensation.
#[tracing::instrument(skip(state))]
pub async fn compensate(
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let view = state
        .orchestrator
        .trigger_manual_compensation(saga_id, &step)
        .await?;
    Ok(Json(SagaStatusResponse::from(&view)))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e: uuid::Error| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
