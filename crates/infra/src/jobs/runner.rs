//! Coordinator-backed job runner.
//!
//! One local worker per runner executes jobs strictly one after another in
//! enqueue order. Cross-process concerns go through the coordinator:
//! - `job:status:<key>` dedups enqueues across every worker process
//! - `counter:global_jobs` caps how many counted jobs run fleet-wide

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kitsu_core::{JobKey, WorkerId};

use super::types::{Criticality, EnqueueOutcome, Job, JobStatus, RetryPolicy};
use crate::coordinator::{Coordinator, CoordinatorError};

pub const GLOBAL_JOB_COUNTER_KEY: &str = "counter:global_jobs";
pub const MAX_RUNNING_JOBS: i64 = 20;

pub fn status_key(key: &JobKey) -> String {
    format!("job:status:{key}")
}

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Fleet-wide ceiling for counted (non-critical) jobs
    pub max_running_jobs: i64,
    /// Local pending-queue bound
    pub queue_capacity: usize,
    pub queued_ttl: Duration,
    pub running_ttl: Duration,
    /// TTL of `succeeded` / `failed`
    pub terminal_ttl: Duration,
    /// Retries for giving a counter slot back
    pub counter_release: RetryPolicy,
    pub drain_poll_interval: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: MAX_RUNNING_JOBS,
            queue_capacity: 1024,
            queued_ttl: Duration::from_secs(3600),
            running_ttl: Duration::from_secs(3600),
            terminal_ttl: Duration::from_secs(86_400),
            counter_release: RetryPolicy::exponential(
                3,
                Duration::from_millis(100),
                Duration::from_millis(400),
            ),
            drain_poll_interval: Duration::from_millis(100),
        }
    }
}

impl JobRunnerConfig {
    pub fn with_max_running_jobs(mut self, max: i64) -> Self {
        self.max_running_jobs = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    fn status_ttl(&self, status: JobStatus) -> Duration {
        match status {
            JobStatus::Queued => self.queued_ttl,
            JobStatus::Running => self.running_ttl,
            JobStatus::Succeeded | JobStatus::Failed => self.terminal_ttl,
        }
    }
}

/// Runner statistics (this process only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub enqueued: u64,
    pub duplicates: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub pending: usize,
}

struct WorkerSlot {
    generation: u64,
    cancel: CancellationToken,
    /// Taken by `stop`; the slot itself stays until the task has exited.
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Job>,
    worker: Option<WorkerSlot>,
    generations: u64,
}

struct Inner {
    coordinator: Arc<dyn Coordinator>,
    config: JobRunnerConfig,
    worker_id: WorkerId,
    queue: Mutex<Queue>,
    enqueue_gate: tokio::sync::Mutex<()>,
    stats: Mutex<RunnerStats>,
}

enum Admission {
    /// Critical job; the counter was not touched.
    Bypassed,
    /// Holds one slot of the global counter until released.
    Counted,
    Refused,
}

/// Cloneable handle to a process-local job runner.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("worker_id", &self.inner.worker_id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobRunner {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: JobRunnerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                config,
                worker_id: WorkerId::new(),
                queue: Mutex::new(Queue::default()),
                enqueue_gate: tokio::sync::Mutex::new(()),
                stats: Mutex::new(RunnerStats::default()),
            }),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.inner.worker_id
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> RunnerStats {
        let pending = locked(&self.inner.queue).pending.len();
        let mut stats = locked(&self.inner.stats).clone();
        stats.pending = pending;
        stats
    }

    /// Claim `job.key` as `queued` and hand the job to the local worker.
    ///
    /// Fire-and-forget: the outcome only says whether the job was accepted.
    pub async fn enqueue(&self, job: Job) -> EnqueueOutcome {
        let inner = &self.inner;
        let _gate = inner.enqueue_gate.lock().await;

        if locked(&inner.queue).pending.len() >= inner.config.queue_capacity {
            warn!(
                job_key = %job.key(),
                criticality = %job.criticality(),
                worker_id = %inner.worker_id,
                reason = "queue_full",
                capacity = inner.config.queue_capacity,
                "job enqueue skipped"
            );
            return EnqueueOutcome::QueueFull;
        }

        let key = status_key(job.key());
        let current = match inner.coordinator.get_value(&key).await {
            Ok(current) => current,
            Err(e) => {
                error!(
                    job_key = %job.key(),
                    worker_id = %inner.worker_id,
                    reason = "redis_unavailable",
                    error = %e,
                    "job enqueue failed"
                );
                return EnqueueOutcome::Unavailable;
            }
        };

        let queued = JobStatus::Queued;
        let ttl = Some(inner.config.status_ttl(queued));
        let claimed = match current.as_deref() {
            None => {
                inner
                    .coordinator
                    .set_value_if_absent(&key, queued.as_str(), ttl)
                    .await
            }
            Some(raw) => match raw.parse::<JobStatus>() {
                Ok(status) if !status.blocks_enqueue() => {
                    inner
                        .coordinator
                        .replace_value(&key, raw, queued.as_str(), ttl)
                        .await
                }
                Ok(status) => {
                    info!(
                        job_key = %job.key(),
                        worker_id = %inner.worker_id,
                        reason = "duplicate",
                        status = %status,
                        "job enqueue skipped"
                    );
                    self.bump(|s| s.duplicates += 1);
                    return EnqueueOutcome::Duplicate;
                }
                Err(_) => {
                    warn!(
                        job_key = %job.key(),
                        worker_id = %inner.worker_id,
                        reason = "unknown_status",
                        status = raw,
                        "job enqueue skipped"
                    );
                    self.bump(|s| s.duplicates += 1);
                    return EnqueueOutcome::Duplicate;
                }
            },
        };

        match claimed {
            Ok(true) => {
                info!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %inner.worker_id,
                    "job enqueued"
                );
                self.bump(|s| s.enqueued += 1);
                self.push(job);
                EnqueueOutcome::Enqueued
            }
            Ok(false) => {
                info!(
                    job_key = %job.key(),
                    worker_id = %inner.worker_id,
                    reason = "duplicate",
                    "job enqueue skipped"
                );
                self.bump(|s| s.duplicates += 1);
                EnqueueOutcome::Duplicate
            }
            Err(e) => {
                error!(
                    job_key = %job.key(),
                    worker_id = %inner.worker_id,
                    reason = "redis_error",
                    error = %e,
                    "job enqueue failed"
                );
                EnqueueOutcome::Unavailable
            }
        }
    }

    /// Point-in-time status read. `None` if absent or unreadable.
    pub async fn status_for(&self, key: &JobKey) -> Option<JobStatus> {
        match self.inner.coordinator.get_value(&status_key(key)).await {
            Ok(Some(raw)) => match raw.parse() {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(job_key = %key, error = %e, "unreadable job status");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(job_key = %key, error = %e, "failed to read job status");
                None
            }
        }
    }

    /// Wait (polling) until the local worker has nothing left to do.
    ///
    /// Returns immediately when no worker is running, including after `stop`
    /// left jobs in the queue. A worker that is still stopping counts as running.
    pub async fn drain(&self) {
        while locked(&self.inner.queue).worker.is_some() {
            tokio::time::sleep(self.inner.config.drain_poll_interval).await;
        }
    }

    /// Cancel the worker and wait for it to exit.
    ///
    /// A handler that is already running finishes first; pending jobs stay
    /// queued and are picked up by the first `enqueue` after the worker exits.
    pub async fn stop(&self) {
        let (generation, handle) = {
            let mut queue = locked(&self.inner.queue);
            let Some(slot) = queue.worker.as_mut() else {
                return;
            };
            slot.cancel.cancel();
            (slot.generation, slot.handle.take())
        };

        let Some(handle) = handle else {
            // Another `stop` owns the handle.
            self.drain().await;
            return;
        };

        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!(worker_id = %self.inner.worker_id, error = %e, "job worker panicked");
            }
        }

        let mut queue = locked(&self.inner.queue);
        if queue.worker.as_ref().map(|w| w.generation) == Some(generation) {
            queue.worker = None;
        }
        info!(
            worker_id = %self.inner.worker_id,
            pending = queue.pending.len(),
            "job worker stopped"
        );
    }

    fn bump(&self, f: impl FnOnce(&mut RunnerStats)) {
        f(&mut locked(&self.inner.stats));
    }

    fn push(&self, job: Job) {
        let mut queue = locked(&self.inner.queue);
        queue.pending.push_back(job);

        // A stopping worker keeps its slot, so nothing new starts beside it.
        if queue.worker.is_none() {
            queue.generations += 1;
            let generation = queue.generations;
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(self.clone().work(generation, cancel.clone()));
            queue.worker = Some(WorkerSlot {
                generation,
                cancel,
                handle: Some(handle),
            });
        }
    }

    async fn work(self, generation: u64, cancel: CancellationToken) {
        debug!(worker_id = %self.inner.worker_id, generation, "job worker started");

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let job = {
                let mut queue = locked(&self.inner.queue);
                match queue.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        if queue.worker.as_ref().map(|w| w.generation) == Some(generation) {
                            queue.worker = None;
                        }
                        debug!(worker_id = %self.inner.worker_id, generation, "job worker idle");
                        return;
                    }
                }
            };

            self.run_job(job, &cancel).await;
        }
    }

    async fn run_job(&self, mut job: Job, cancel: &CancellationToken) {
        let admission = self.admit(&job).await;
        if matches!(admission, Admission::Refused) {
            return;
        }

        if let Err(e) = self.execute(&mut job, cancel).await {
            error!(
                job_key = %job.key(),
                criticality = %job.criticality(),
                worker_id = %self.inner.worker_id,
                error = %e,
                "job aborted on coordinator error"
            );
            self.bump(|s| s.failed += 1);
        }

        if matches!(admission, Admission::Counted) {
            self.release_slot(&job).await;
        }
    }

    async fn admit(&self, job: &Job) -> Admission {
        if !job.criticality().is_counted() {
            return Admission::Bypassed;
        }

        let max = self.inner.config.max_running_jobs;
        match self
            .inner
            .coordinator
            .increment_if_below(GLOBAL_JOB_COUNTER_KEY, max)
            .await
        {
            Ok(true) => Admission::Counted,
            Ok(false) => {
                self.refuse(job, "global_limit_exceeded", None).await;
                Admission::Refused
            }
            Err(e) => {
                self.refuse(job, "redis_unavailable", Some(&e)).await;
                Admission::Refused
            }
        }
    }

    /// Drop (best effort) or reject (important) a job without running it.
    async fn refuse(&self, job: &Job, reason: &'static str, cause: Option<&CoordinatorError>) {
        let key = status_key(job.key());
        let ttl = Some(self.inner.config.status_ttl(JobStatus::Failed));
        // The coordinator may be the reason we got here; the status write is best effort.
        if let Err(e) = self
            .inner
            .coordinator
            .set_value(&key, JobStatus::Failed.as_str(), ttl)
            .await
        {
            warn!(
                job_key = %job.key(),
                worker_id = %self.inner.worker_id,
                error = %e,
                "failed to record refused job status"
            );
        }

        let max = self.inner.config.max_running_jobs;
        let cause = cause.map(ToString::to_string);
        let worker_id = self.inner.worker_id;
        match job.criticality() {
            Criticality::BestEffort => {
                warn!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %worker_id,
                    reason,
                    max,
                    error = cause.as_deref(),
                    "job dropped"
                );
                self.bump(|s| s.dropped += 1);
            }
            _ => {
                error!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %worker_id,
                    reason,
                    max,
                    error = cause.as_deref(),
                    "job rejected"
                );
                self.bump(|s| s.rejected += 1);
            }
        }
    }

    /// Status write. Critical jobs keep going when it fails.
    async fn write_status(&self, job: &Job, status: JobStatus) -> Result<(), CoordinatorError> {
        let ttl = Some(self.inner.config.status_ttl(status));
        match self
            .inner
            .coordinator
            .set_value(&status_key(job.key()), status.as_str(), ttl)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if job.criticality() == Criticality::Critical => {
                warn!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %self.inner.worker_id,
                    status = %status,
                    error = %e,
                    "job status write failed; continuing"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, job: &mut Job, cancel: &CancellationToken) -> Result<(), CoordinatorError> {
        let worker_id = self.inner.worker_id;

        self.write_status(job, JobStatus::Running).await?;
        info!(
            job_key = %job.key(),
            criticality = %job.criticality(),
            worker_id = %worker_id,
            "job started"
        );
        self.bump(|s| s.started += 1);

        let policy = job.retry_policy();
        loop {
            // Own task per attempt: a panicking handler is just a failed attempt.
            let outcome = match tokio::spawn(job.invoke()).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("handler panicked: {e}")),
            };

            let err = match outcome {
                Ok(()) => {
                    self.write_status(job, JobStatus::Succeeded).await?;
                    info!(
                        job_key = %job.key(),
                        criticality = %job.criticality(),
                        worker_id = %worker_id,
                        "job succeeded"
                    );
                    self.bump(|s| s.succeeded += 1);
                    return Ok(());
                }
                Err(err) => err,
            };

            let attempt = job.record_failure();
            error!(
                job_key = %job.key(),
                criticality = %job.criticality(),
                worker_id = %worker_id,
                attempt,
                max_attempts = job.max_attempts(),
                error = %format!("{err:#}"),
                "job attempt failed"
            );

            if !policy.should_retry(attempt) {
                self.write_status(job, JobStatus::Failed).await?;
                error!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %worker_id,
                    attempts = attempt,
                    "job failed permanently"
                );
                self.bump(|s| s.failed += 1);
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.write_status(job, JobStatus::Failed).await?;
                    warn!(
                        job_key = %job.key(),
                        criticality = %job.criticality(),
                        worker_id = %worker_id,
                        attempts = attempt,
                        reason = "cancelled",
                        "job abandoned during backoff"
                    );
                    self.bump(|s| s.failed += 1);
                    return Ok(());
                }
                _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
            }
        }
    }

    /// Give the counter slot back, retrying with exponential backoff.
    ///
    /// Exhausting the retries leaves the counter inflated by one until it is
    /// reset by hand.
    async fn release_slot(&self, job: &Job) {
        let policy = &self.inner.config.counter_release;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self
                .inner
                .coordinator
                .decrement_counter(GLOBAL_JOB_COUNTER_KEY)
                .await
            {
                Ok(_) => return,
                Err(e) => e,
            };

            if !policy.should_retry(attempt) {
                error!(
                    job_key = %job.key(),
                    criticality = %job.criticality(),
                    worker_id = %self.inner.worker_id,
                    attempts = attempt,
                    error = %err,
                    "counter decrement failed permanently"
                );
                return;
            }

            warn!(
                job_key = %job.key(),
                worker_id = %self.inner.worker_id,
                attempt,
                max_attempts = policy.max_attempts,
                error = %err,
                "counter decrement retry"
            );
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        }
    }
}
