use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "job_system_running": services.system.is_running().await,
            "processor": services.system.processor_stats(),
        })),
    )
        .into_response()
}
