//! Composition root: one coordinator handle shared by every component.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use kitsu_infra::config::Settings;
use kitsu_infra::coordinator::{Coordinator, CoordinatorError, InMemoryCoordinator};
use kitsu_infra::jobs::JobRunner;
use kitsu_infra::rate_limit::{AuthRateLimiter, RateLimiter};
use kitsu_infra::scheduler::{ParserAutoupdateScheduler, RunnerAutoupdateService, StaticSettingsSource};

pub struct AppServices {
    pub coordinator: Arc<dyn Coordinator>,
    pub runner: JobRunner,
    pub scheduler: ParserAutoupdateScheduler,
    pub parser_settings: Arc<StaticSettingsSource>,
    pub auth_rate_limit: AuthRateLimiter,
    pub trusted_proxies: Vec<IpAddr>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("runner", &self.runner)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Pick the coordinator backend from `REDIS_URL`.
pub fn build_coordinator(settings: &Settings) -> Result<Arc<dyn Coordinator>, CoordinatorError> {
    match settings.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            info!("using redis coordinator");
            Ok(Arc::new(kitsu_infra::coordinator::RedisCoordinator::new(url)?))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL is set but the redis feature is disabled; using in-memory coordinator");
            Ok(Arc::new(InMemoryCoordinator::new()))
        }
        None => {
            warn!("REDIS_URL not set; using in-memory coordinator (single process only)");
            Ok(Arc::new(InMemoryCoordinator::new()))
        }
    }
}

pub fn build_services(settings: &Settings) -> Result<AppServices, CoordinatorError> {
    let coordinator = build_coordinator(settings)?;
    Ok(AppServices::new(settings, coordinator))
}

impl AppServices {
    pub fn new(settings: &Settings, coordinator: Arc<dyn Coordinator>) -> Self {
        let runner = JobRunner::new(coordinator.clone(), settings.runner_config());
        let parser_settings = Arc::new(StaticSettingsSource::new(settings.parser));

        let autoupdate = RunnerAutoupdateService::new(runner.clone(), settings.jobs.defaults, || async {
            // Fetching and matching live in the parser service; this job only marks the tick.
            info!("parser autoupdate job executed");
            Ok(())
        });
        let scheduler = ParserAutoupdateScheduler::new(
            coordinator.clone(),
            parser_settings.clone(),
            Arc::new(autoupdate),
            settings.scheduler_config(),
        );

        let limits = &settings.auth_rate_limit;
        let auth_rate_limit = AuthRateLimiter::new(RateLimiter::new(
            coordinator.clone(),
            limits.max_attempts,
            limits.window,
            limits.failure_policy,
        ));

        Self {
            coordinator,
            runner,
            scheduler,
            parser_settings,
            auth_rate_limit,
            trusted_proxies: settings.trusted_proxies.clone(),
        }
    }

    /// Try to become the autoupdate scheduler for the fleet.
    pub async fn start(&self) -> bool {
        if let Err(e) = self.coordinator.ping().await {
            warn!(error = %e, "coordinator not reachable at startup");
        }
        self.scheduler.start().await
    }

    /// Scheduler first (it produces jobs), then let the runner finish its queue.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.runner.drain().await;
        self.runner.stop().await;
        info!("services stopped");
    }
}
