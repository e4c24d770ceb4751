use std::sync::Arc;

use axum::{extract::Path, http::StatusCode, response::IntoResponse, Extension, Json};

use kitsu_core::JobKey;

use crate::app::{
    dto::{JobStatsResponse, JobStatusResponse},
    errors,
    services::AppServices,
};

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> Json<JobStatsResponse> {
    Json(JobStatsResponse {
        worker_id: services.runner.worker_id().to_string(),
        stats: services.runner.stats(),
    })
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let key = match JobKey::new(key) {
        Ok(k) => k,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_key", e.to_string()),
    };

    let status = services.runner.status_for(&key).await;
    Json(JobStatusResponse {
        key: key.to_string(),
        status,
    })
    .into_response()
}
