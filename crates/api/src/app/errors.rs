use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use kitsu_infra::rate_limit::{RateLimitError, RATE_LIMIT_MESSAGE};
use kitsu_infra::scheduler::SchedulerError;

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

pub fn rate_limit_error_to_response(err: RateLimitError) -> axum::response::Response {
    match err {
        RateLimitError::RateLimited => {
            json_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", RATE_LIMIT_MESSAGE)
        }
        RateLimitError::InvalidKey(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
    }
}

pub fn scheduler_error_to_response(err: SchedulerError) -> axum::response::Response {
    match err {
        SchedulerError::Settings(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "settings_unavailable", err.to_string())
        }
        SchedulerError::Service(_) => {
            json_error(StatusCode::BAD_GATEWAY, "autoupdate_failed", err.to_string())
        }
    }
}
