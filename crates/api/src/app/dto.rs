use serde::{Deserialize, Serialize};

use kitsu_infra::jobs::{JobStatus, RunnerStats};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct RunAutoupdateQuery {
    /// Manual runs are forced unless the caller says otherwise.
    pub force: Option<bool>,
}

/// Fields left out keep their current value.
#[derive(Debug, Deserialize)]
pub struct UpdateParserSettingsRequest {
    pub enable_autoupdate: Option<bool>,
    pub update_interval_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRateLimitQuery {
    pub email: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub coordinator: &'static str,
}

#[derive(Debug, Serialize)]
pub struct JobStatsResponse {
    pub worker_id: String,
    #[serde(flatten)]
    pub stats: RunnerStats,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub key: String,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub attempts: Option<i64>,
    pub max_attempts: u32,
}
