//! Core job types and policies.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kitsu_core::{DomainError, JobKey};

/// How a job is treated when the global running-job ceiling is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Never checked against the ceiling; always starts.
    Critical,
    /// Counted; rejected (logged as an error) when the ceiling is reached.
    #[default]
    Important,
    /// Counted; dropped (logged as a warning) when the ceiling is reached.
    BestEffort,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::Important => "important",
            Criticality::BestEffort => "best_effort",
        }
    }

    /// Whether admission goes through the global counter.
    pub fn is_counted(&self) -> bool {
        !matches!(self, Criticality::Critical)
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criticality {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Criticality::Critical),
            "important" => Ok(Criticality::Important),
            "best_effort" => Ok(Criticality::BestEffort),
            other => Err(DomainError::validation(format!("unknown criticality: {other}"))),
        }
    }
}

/// Job status as stored under `job:status:<key>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Every status except `failed` prevents the same key from being enqueued again.
    pub fn blocks_enqueue(&self) -> bool {
        !matches!(self, JobStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    #[default]
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (including the first one)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2_u32.saturating_pow(attempt - 1)),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Zero-argument async action. Called once per attempt.
pub type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// A unit of deferred work.
#[derive(Clone)]
pub struct Job {
    key: JobKey,
    handler: JobHandler,
    max_attempts: u32,
    backoff: Duration,
    attempts: u32,
    criticality: Criticality,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("attempts", &self.attempts)
            .field("criticality", &self.criticality)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new<F, Fut>(key: JobKey, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            key,
            handler: Arc::new(move || Box::pin(handler()) as JobFuture),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            attempts: 0,
            criticality: Criticality::default(),
        }
    }

    /// At least one attempt always runs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn criticality(&self) -> Criticality {
        self.criticality
    }

    /// Linear backoff capped at `backoff * max_attempts`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.max_attempts,
            self.backoff,
            self.backoff.saturating_mul(self.max_attempts),
        )
    }

    pub(crate) fn invoke(&self) -> JobFuture {
        (self.handler)()
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}

/// Retry defaults applied to jobs built through [`JobDefaults::job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl JobDefaults {
    pub fn job<F, Fut>(&self, key: JobKey, handler: F) -> Job
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Job::new(key, handler)
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff)
    }
}

/// Result of [`JobRunner::enqueue`](super::JobRunner::enqueue).
///
/// Only reflects the dedup/admission-to-queue decision, never the final job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Status claimed as `queued`; the job is in the local queue.
    Enqueued,
    /// The key is already queued, running or succeeded (here or on another worker).
    Duplicate,
    /// The local queue is at capacity; nothing was written.
    QueueFull,
    /// The coordinator could not be reached.
    Unavailable,
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueOutcome::Enqueued => "enqueued",
            EnqueueOutcome::Duplicate => "duplicate",
            EnqueueOutcome::QueueFull => "queue_full",
            EnqueueOutcome::Unavailable => "unavailable",
        }
    }

    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued)
    }
}

impl fmt::Display for EnqueueOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
