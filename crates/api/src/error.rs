//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use thiserror::Error;

/// Errors returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed path or query parameter.
    #[error("{0}")]
    BadRequest(String),
    /// Engine error; the status code depends on the variant.
    #[error(transparent)]
    Saga(#[from] SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::DefinitionValidation(_) => StatusCode::BAD_REQUEST,
        SagaError::DefinitionNotFound(_)
        | SagaError::SagaNotFound(_)
        | SagaError::StepNotFound { .. } => StatusCode::NOT_FOUND,
        SagaError::InvalidTransition { .. }
        | SagaError::InvalidStepTransition { .. }
        | SagaError::InvalidState { .. }
        | SagaError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SagaError::Compensation { .. } | SagaError::Repository(_) => {
            tracing::error!(error = %err, "saga operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use saga::{SagaStatus, ValidationError};

    fn status_of(err: SagaError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_saga_error_status_codes() {
        assert_eq!(
            status_of(SagaError::DefinitionValidation(ValidationError::NoSteps)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SagaError::SagaNotFound(SagaId::new())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SagaError::InvalidTransition {
                from: SagaStatus::Completed,
                to: SagaStatus::Cancelled,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::AlreadyRunning(SagaId::new())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::Compensation {
                step: "refund".into(),
                reason: "gateway down".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_bad_request_status() {
        let response = ApiError::BadRequest("Invalid saga id".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
