use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/ready", get(ready_jobs))
        .route("/stats", get(queue_stats))
        .route("/cleanup", post(cleanup))
}

/// Jobs a processor would pick up now, in pick order.
pub async fn ready_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ReadyQuery>,
) -> axum::response::Response {
    match services.queue.get_ready_jobs(query.limit()).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn queue_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue.get_queue_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "entries": stats.entries,
                "total": stats.total,
                "processor": services.system.processor_stats(),
            })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cleanup(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::CleanupRequest>>,
) -> axum::response::Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let completed = body
        .completed_older_than_hours
        .map(hours)
        .unwrap_or(services.config.completed_retention);
    let failed = body
        .failed_older_than_hours
        .map(hours)
        .unwrap_or(services.config.failed_retention);

    let completed_removed = match services.queue.cleanup_completed_jobs(completed).await {
        Ok(n) => n,
        Err(e) => return errors::queue_error_to_response(e),
    };
    let expired_removed = match services.queue.cleanup_expired_jobs(failed).await {
        Ok(n) => n,
        Err(e) => return errors::queue_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(json!({
            "completed_removed": completed_removed,
            "expired_removed": expired_removed,
        })),
    )
        .into_response()
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}
