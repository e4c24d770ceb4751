//! Parser autoupdate: a recurring job that runs on exactly one process.

pub mod autoupdate;
pub mod ports;
pub mod runner_service;

pub use autoupdate::{
    ParserAutoupdateScheduler, SchedulerConfig, SchedulerError, SCHEDULER_LOCK_KEY,
    SCHEDULER_LOCK_TTL,
};
pub use ports::{
    resolve_update_interval_minutes, AutoupdateService, AutoupdateSummary, ParserSettings,
    ParserSettingsSource, StaticSettingsSource, DEFAULT_INTERVAL_MINUTES,
};
pub use runner_service::RunnerAutoupdateService;
