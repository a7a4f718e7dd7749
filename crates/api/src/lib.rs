//! HTTP API server with observability for the saga orchestration engine.
//!
//! Provides REST endpoints for definition management and saga execution,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    EngineConfig, InMemorySagaRepository, InMemoryStepExecutor, LoggingEventPublisher,
    Orchestrator, SagaError, SystemClock, blueprints,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Orchestrator wired to the in-process collaborators.
pub type AppOrchestrator =
    Orchestrator<InMemorySagaRepository, InMemoryStepExecutor, LoggingEventPublisher>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: AppOrchestrator,
    /// Defaults for definitions registered over HTTP.
    pub engine_config: EngineConfig,
    /// Handle on the executor behind the orchestrator.
    pub executor: InMemoryStepExecutor,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/definitions", post(routes::definitions::register))
        .route("/definitions", get(routes::definitions::list))
        .route("/definitions/{saga_type}", get(routes::definitions::get))
        .route("/sagas", post(routes::sagas::start))
        .route("/sagas/{id}", get(routes::sagas::status))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel))
        .route(
            "/sagas/{id}/steps/{step}/compensate",
            post(routes::sagas::compensate),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the default application state: in-memory collaborators, the
/// system clock, and every built-in blueprint registered.
pub async fn create_default_state(engine_config: EngineConfig) -> Result<Arc<AppState>, SagaError> {
    let executor = InMemoryStepExecutor::new();
    let orchestrator = Orchestrator::new(
        InMemorySagaRepository::new(),
        Arc::new(executor.clone()),
        LoggingEventPublisher,
        Arc::new(SystemClock),
    );

    for definition in blueprints::all(&engine_config) {
        orchestrator.register_definition(definition).await?;
    }

    Ok(Arc::new(AppState {
        orchestrator,
        engine_config,
        executor,
    }))
}
