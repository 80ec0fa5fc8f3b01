use axum::Router;

pub mod jobs;
pub mod subjects;
pub mod system;

/// Router for all job and subject endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/subjects", subjects::router())
}
