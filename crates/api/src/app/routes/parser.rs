use std::sync::Arc;

use axum::{extract::Query, http::StatusCode, response::IntoResponse, Extension, Json};
use tracing::info;

use kitsu_infra::scheduler::ParserSettings;

use crate::app::{
    dto::{RunAutoupdateQuery, SchedulerStateResponse, UpdateParserSettingsRequest},
    errors,
    services::AppServices,
};

pub async fn state(Extension(services): Extension<Arc<AppServices>>) -> Json<SchedulerStateResponse> {
    Json(SchedulerStateResponse {
        running: services.scheduler.is_running().await,
    })
}

/// Run one autoupdate cycle on this process, bypassing the scheduler lock.
pub async fn run_once(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<RunAutoupdateQuery>,
) -> axum::response::Response {
    let force = query.force.unwrap_or(true);
    match services.scheduler.run_once(force).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::scheduler_error_to_response(e),
    }
}

pub async fn settings(Extension(services): Extension<Arc<AppServices>>) -> Json<ParserSettings> {
    Json(services.parser_settings.current())
}

/// Takes effect on the scheduler's next tick.
pub async fn update_settings(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<UpdateParserSettingsRequest>,
) -> axum::response::Response {
    let mut next = services.parser_settings.current();
    if let Some(enabled) = req.enable_autoupdate {
        next.enable_autoupdate = enabled;
    }
    if let Some(minutes) = req.update_interval_minutes {
        if minutes < 1 {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "update_interval_minutes must be at least 1",
            );
        }
        next.update_interval_minutes = minutes;
    }

    services.parser_settings.update(next);
    info!(
        enable_autoupdate = next.enable_autoupdate,
        update_interval_minutes = next.update_interval_minutes,
        "parser settings updated"
    );
    Json(next).into_response()
}
