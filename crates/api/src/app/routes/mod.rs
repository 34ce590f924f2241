use axum::Router;

pub mod jobs;
pub mod pipelines;
pub mod queue;
pub mod system;

/// Router for the job and pipeline endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/queue", queue::router())
        .nest("/pipelines", pipelines::router())
}
