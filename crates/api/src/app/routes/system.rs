use std::sync::Arc;

use axum::{http::StatusCode, Extension, Json};
use tracing::warn;

use crate::app::{dto::HealthResponse, services::AppServices};

/// Liveness plus a coordinator ping; a down coordinator degrades, it doesn't fail.
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
) -> (StatusCode, Json<HealthResponse>) {
    let coordinator = match services.coordinator.ping().await {
        Ok(()) => "up",
        Err(e) => {
            warn!(error = %e, "health check: coordinator unreachable");
            "down"
        }
    };

    let status = if coordinator == "up" { "ok" } else { "degraded" };
    (StatusCode::OK, Json(HealthResponse { status, coordinator }))
}
