use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use docqueue_core::JobId;
use docqueue_infra::jobs::{EnqueueRequest, EnqueueResult};

use crate::app::errors::{
    domain_error_to_response, enqueue_error_to_response, json_error, store_error_to_response,
};
use crate::app::services::AppServices;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job))
        .route("/:id", get(get_job))
        .route("/:id/requeue", post(requeue_job))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /jobs
///
/// 201 when a job was created, 200 when an active job with the same idempotency key
/// already existed.
pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    match services.enqueuer.enqueue(request).await {
        Ok(result) => enqueue_response(result),
        Err(e) => enqueue_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return domain_error_to_response(e),
    };

    match services.store().get(job_id).await {
        Ok(Some(job)) => Json(job.status_view()).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => store_error_to_response(e),
    }
}

/// POST /jobs/:id/requeue
///
/// Enqueue a fresh copy of a `failed`/`dead` job. 409 while the job is still active.
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return domain_error_to_response(e),
    };

    match services.enqueuer.requeue(job_id).await {
        Ok(result) => enqueue_response(result),
        Err(e) => enqueue_error_to_response(e),
    }
}

fn enqueue_response(result: EnqueueResult) -> axum::response::Response {
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(result)).into_response()
}
