use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;

use commitpulse_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job).patch(update_job).delete(delete_job))
        .route("/:id/fail", post(fail_job))
        .route("/:id/dependencies", get(list_dependencies).post(add_dependency))
        .route("/:id/dependencies/:depends_on_id", delete(remove_dependency))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let spec = match body.into_new_job() {
        Ok(spec) => spec,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.queue.create_job(spec).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.queue.get_jobs_by_filter(&filter).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.get_job(id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn update_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateJobRequest>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.update_job(id, &body.into_update()).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.delete_job(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// Operator cancellation of a pending or running job. Finished jobs get 409.
pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::FailJobRequest>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.mark_job_as_failed(id, body.message, body.details).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_dependencies(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if let Err(e) = services.queue.get_job(id).await {
        return errors::queue_error_to_response(e);
    }

    match services.queue.get_job_dependencies(id).await {
        Ok(deps) => (StatusCode::OK, Json(deps)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn add_dependency(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddDependencyRequest>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.add_job_dependency(id, body.depends_on_id).await {
        Ok(dep) => (StatusCode::CREATED, Json(dep)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn remove_dependency(
    Extension(services): Extension<Arc<AppServices>>,
    Path((id, depends_on_id)): Path<(String, String)>,
) -> axum::response::Response {
    let (id, depends_on_id) = match (parse_job_id(&id), parse_job_id(&depends_on_id)) {
        (Ok(id), Ok(dep)) => (id, dep),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    match services.queue.remove_job_dependency(id, depends_on_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "job_id": id, "depends_on_id": depends_on_id, "removed": true })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
