use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use kitsu_core::JobKey;

use super::ports::{AutoupdateService, AutoupdateSummary, ParserSettings};
use crate::jobs::{Criticality, Job, JobDefaults, JobFuture, JobRunner};

/// Autoupdate service that hands each tick to the [`JobRunner`].
///
/// Ticks are keyed by UTC minute (`parser:autoupdate:<YYYYmmddTHHMM>`), so two
/// workers firing in the same minute produce one job, while the next tick is
/// never blocked by the previous tick's `succeeded` status.
pub struct RunnerAutoupdateService {
    runner: JobRunner,
    defaults: JobDefaults,
    criticality: Criticality,
    handler: Arc<dyn Fn() -> JobFuture + Send + Sync>,
}

impl RunnerAutoupdateService {
    pub fn new<F, Fut>(runner: JobRunner, defaults: JobDefaults, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            runner,
            defaults,
            criticality: Criticality::Important,
            handler: Arc::new(move || Box::pin(handler()) as JobFuture),
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn job_key_at(now: DateTime<Utc>) -> anyhow::Result<JobKey> {
        Ok(JobKey::new(format!(
            "parser:autoupdate:{}",
            now.format("%Y%m%dT%H%M")
        ))?)
    }
}

#[async_trait]
impl AutoupdateService for RunnerAutoupdateService {
    async fn run(&self, settings: &ParserSettings, force: bool) -> anyhow::Result<AutoupdateSummary> {
        let key = Self::job_key_at(Utc::now())?;
        let handler = self.handler.clone();
        let job = self
            .defaults
            .job(key.clone(), move || handler())
            .with_criticality(self.criticality);

        let outcome = self.runner.enqueue(job).await;
        info!(
            job_key = %key,
            outcome = %outcome,
            force,
            enable_autoupdate = settings.enable_autoupdate,
            "parser autoupdate tick"
        );

        Ok(AutoupdateSummary::new(outcome.as_str()).with_extra("job_key", key.as_str()))
    }
}
