use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use commitpulse_core::DomainError;
use commitpulse_infra::jobs::QueueError;
use commitpulse_infra::pipeline::{AdmissionError, PipelineError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        e @ QueueError::Cycle { .. } => json_error(StatusCode::CONFLICT, "dependency_cycle", e.to_string()),
        e @ QueueError::ClaimConflict(_) => json_error(StatusCode::CONFLICT, "claim_conflict", e.to_string()),
        e @ QueueError::Finished { .. } => json_error(StatusCode::CONFLICT, "job_finished", e.to_string()),
        QueueError::Store(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::Admission(AdmissionError::InsufficientCredits {
            required,
            available,
            billing_url,
        }) => (
            StatusCode::PAYMENT_REQUIRED,
            axum::Json(json!({
                "error": "insufficient_credits",
                "message": format!("{required} credits required, {available} available"),
                "required": required,
                "available": available,
                "billing_url": billing_url,
            })),
        )
            .into_response(),
        PipelineError::Admission(e @ AdmissionError::Ledger(_)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable", e.to_string())
        }
        PipelineError::Queue(e) => queue_error_to_response(e),
        PipelineError::Commits(e) => {
            tracing::error!(error = %e, "commit store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
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
