use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docqueue_core::DomainError;
use docqueue_infra::jobs::{EnqueueError, JobStoreError};

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store error");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg)
        }
    }
}

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::Domain(e) => domain_error_to_response(e),
        EnqueueError::Store(e) => store_error_to_response(e),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
