//! Per-subject status: point-in-time query and live SSE stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::get,
};
use tokio_stream::StreamExt;

use docqueue_core::SubjectId;
use docqueue_events::{StatusEvent, StatusEventKind, SubjectStatus};

use crate::app::errors::{domain_error_to_response, store_error_to_response};
use crate::app::services::{AppServices, SUBJECT_STATUS_LIMIT};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router {
    Router::new()
        .route("/:id/status", get(subject_status))
        .route("/:id/events", get(stream_subject_events))
}

/// GET /subjects/:id/status
///
/// What a late subscriber reads instead of replaying missed events.
pub async fn subject_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let subject_id = match SubjectId::parse(id) {
        Ok(s) => s,
        Err(e) => return domain_error_to_response(e),
    };

    match services
        .store()
        .list_by_subject(&subject_id, SUBJECT_STATUS_LIMIT)
        .await
    {
        Ok(jobs) => Json(SubjectStatus {
            subject_id,
            jobs: jobs.iter().map(|j| j.status_view()).collect(),
        })
        .into_response(),
        Err(e) => store_error_to_response(e),
    }
}

/// GET /subjects/:id/events
///
/// Stream the subject's status events via Server-Sent Events. The SSE event name is
/// the event type (`progress`, `completed`, `failed`); a `heartbeat` comment keeps idle
/// connections open.
pub async fn stream_subject_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let subject_id = match SubjectId::parse(id) {
        Ok(s) => s,
        Err(e) => return domain_error_to_response(e),
    };

    tracing::debug!(subject_id = %subject_id, "status stream opened");
    let stream = services
        .channel
        .subscribe(&subject_id)
        .into_stream()
        .filter_map(|event| to_sse(&event).map(Ok::<_, Infallible>));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
        .into_response()
}

fn to_sse(event: &StatusEvent) -> Option<SseEvent> {
    let name = match event.kind {
        StatusEventKind::Progress => "progress",
        StatusEventKind::Completed => "completed",
        StatusEventKind::Failed => "failed",
    };
    let data = serde_json::to_string(event).ok()?;
    Some(SseEvent::default().event(name).data(data))
}
