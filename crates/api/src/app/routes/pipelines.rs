use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use commitpulse_infra::pipeline::{CommitPipelineRequest, DigestOutcome, DigestRequest};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/commits", post(enqueue_commit))
        .route("/digests", post(create_digest))
}

pub async fn enqueue_commit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CommitPipelineRequest>,
) -> axum::response::Response {
    match services.pipeline.enqueue(body).await {
        Ok(jobs) => (StatusCode::CREATED, Json(jobs)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn create_digest(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<DigestRequest>,
) -> axum::response::Response {
    match services.digests.create_digest(body).await {
        Ok(outcome @ DigestOutcome::Scheduled { .. }) => {
            (StatusCode::CREATED, Json(outcome)).into_response()
        }
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
