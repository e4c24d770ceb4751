//! Background jobs with cross-process dedup, admission control and retries.
//!
//! ## Lifecycle of a key
//!
//! `(absent) -> queued -> running -> succeeded | failed`
//!
//! - `queued`, `running` and `succeeded` block a second enqueue of the same key
//! - `failed` does not; the next enqueue takes the key over
//! - entries expire (1h for `queued`/`running`, 24h for terminal states)
//!
//! ## Admission
//!
//! Non-critical jobs take a slot of `counter:global_jobs` before they start
//! and give it back when they finish. At the ceiling, `best_effort` jobs are
//! dropped and `important` jobs rejected. `critical` jobs never touch the
//! counter.

pub mod runner;
pub mod types;

pub use runner::{
    status_key, JobRunner, JobRunnerConfig, RunnerStats, GLOBAL_JOB_COUNTER_KEY, MAX_RUNNING_JOBS,
};
pub use types::{
    BackoffStrategy, Criticality, EnqueueOutcome, Job, JobDefaults, JobFuture, JobHandler,
    JobStatus, RetryPolicy,
};
