//! Fleet-wide singleton scheduler for parser autoupdate.
//!
//! ## States
//!
//! `stopped -> (lock attempt) -> passive | running`
//!
//! - **running**: this process holds the lock. A main task runs one cycle and
//!   sleeps for the configured interval; an extender task renews the lock every
//!   `ttl / 2`.
//! - **passive**: a peer holds the lock (or the coordinator was unreachable).
//!   Nothing retries on its own; `start` has to be called again.
//!
//! When a renewal fails the extender cancels the main task. Renewal and
//! release are owner-checked, so a process whose lock lapsed and was taken
//! over can neither keep the peer's lock alive nor delete it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ports::{
    resolve_update_interval_minutes, AutoupdateService, AutoupdateSummary, ParserSettingsSource,
    DEFAULT_INTERVAL_MINUTES,
};
use crate::coordinator::Coordinator;
use crate::lock::DistributedLock;

pub const SCHEDULER_LOCK_KEY: &str = "parser_autoupdate_scheduler";
pub const SCHEDULER_LOCK_TTL: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to load parser settings: {0}")]
    Settings(#[source] anyhow::Error),

    #[error("autoupdate run failed: {0}")]
    Service(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lock_name: String,
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_name: SCHEDULER_LOCK_KEY.to_string(),
            lock_ttl: SCHEDULER_LOCK_TTL,
        }
    }
}

/// One autoupdate cycle, independent of lock ownership.
struct Cycle {
    settings: Arc<dyn ParserSettingsSource>,
    service: Arc<dyn AutoupdateService>,
}

impl Cycle {
    async fn run(&self, force: bool) -> Result<AutoupdateSummary, SchedulerError> {
        let settings = self.settings.load().await.map_err(SchedulerError::Settings)?;
        let interval = resolve_update_interval_minutes(&settings);

        if !settings.enable_autoupdate && !force {
            return Ok(AutoupdateSummary::disabled(interval));
        }

        let mut summary = self
            .service
            .run(&settings, true)
            .await
            .map_err(SchedulerError::Service)?;
        summary.interval_minutes = interval;
        Ok(summary)
    }
}

struct Running {
    main: JoinHandle<()>,
    main_cancel: CancellationToken,
    extender: JoinHandle<()>,
    extender_cancel: CancellationToken,
}

pub struct ParserAutoupdateScheduler {
    lock: DistributedLock,
    cycle: Arc<Cycle>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for ParserAutoupdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserAutoupdateScheduler")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl ParserAutoupdateScheduler {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<dyn ParserSettingsSource>,
        service: Arc<dyn AutoupdateService>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lock: DistributedLock::new(coordinator, config.lock_name, config.lock_ttl),
            cycle: Arc::new(Cycle { settings, service }),
            running: Mutex::new(None),
        }
    }

    /// Try to become the fleet's scheduler. Returns whether this process is
    /// running it afterwards; calling it while running is a no-op.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.main.is_finished()) {
            return true;
        }

        match self.lock.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                info!(lock = self.lock.name(), "Scheduler lock NOT acquired - another worker is running the scheduler");
                return false;
            }
            Err(e) => {
                warn!(
                    lock = self.lock.name(),
                    error = %e,
                    "Failed to acquire scheduler lock (coordinator unavailable); scheduler will not start"
                );
                return false;
            }
        }

        info!(lock = self.lock.name(), "Scheduler lock acquired - starting ParserAutoupdateScheduler");

        let main_cancel = CancellationToken::new();
        let extender_cancel = CancellationToken::new();
        let main = tokio::spawn(main_loop(self.cycle.clone(), main_cancel.clone()));
        let extender = tokio::spawn(extend_loop(
            self.lock.clone(),
            main_cancel.clone(),
            extender_cancel.clone(),
        ));

        *running = Some(Running {
            main,
            main_cancel,
            extender,
            extender_cancel,
        });
        true
    }

    /// Full shutdown: extender, then main task, then the lock.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.extender_cancel.cancel();
        let _ = running.extender.await;

        running.main_cancel.cancel();
        let _ = running.main.await;

        match self.lock.release().await {
            Ok(true) => info!(lock = self.lock.name(), "Scheduler lock released"),
            Ok(false) => debug!(lock = self.lock.name(), "scheduler lock no longer ours; nothing to release"),
            Err(e) => warn!(lock = self.lock.name(), error = %e, "failed to release scheduler lock"),
        }
    }

    /// Run one cycle now, ignoring lock ownership. Safe from any process.
    pub async fn run_once(&self, force: bool) -> Result<AutoupdateSummary, SchedulerError> {
        self.cycle.run(force).await
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.main.is_finished())
    }
}

async fn main_loop(cycle: Arc<Cycle>, cancel: CancellationToken) {
    loop {
        let interval = tokio::select! {
            _ = cancel.cancelled() => return,
            result = cycle.run(false) => match result {
                Ok(summary) => {
                    debug!(status = %summary.status, interval_minutes = summary.interval_minutes, "autoupdate cycle finished");
                    summary.interval_minutes
                }
                Err(e) => {
                    error!(error = %e, "autoupdate cycle failed");
                    DEFAULT_INTERVAL_MINUTES
                }
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(interval.max(1) * 60)) => {}
        }
    }
}

async fn extend_loop(lock: DistributedLock, main_cancel: CancellationToken, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(lock.renew_interval()) => {}
        }

        match lock.extend().await {
            Ok(true) => debug!(lock = lock.name(), "scheduler lock extended"),
            Ok(false) => {
                error!(lock = lock.name(), "Failed to extend scheduler lock - stopping scheduler");
                main_cancel.cancel();
                return;
            }
            Err(e) => {
                error!(lock = lock.name(), error = %e, "Failed to extend scheduler lock - stopping scheduler");
                main_cancel.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use crate::scheduler::ports::{ParserSettings, StaticSettingsSource};
    use crate::test_support::LogCapture;

    #[derive(Default)]
    struct CountingService {
        runs: AtomicU32,
    }

    #[async_trait]
    impl AutoupdateService for CountingService {
        async fn run(&self, _settings: &ParserSettings, _force: bool) -> anyhow::Result<AutoupdateSummary> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AutoupdateSummary::new("ok").with_extra("run", n))
        }
    }

    struct BrokenSettings;

    #[async_trait]
    impl ParserSettingsSource for BrokenSettings {
        async fn load(&self) -> anyhow::Result<ParserSettings> {
            anyhow::bail!("settings table unavailable")
        }
    }

    fn enabled(minutes: i64) -> Arc<StaticSettingsSource> {
        Arc::new(StaticSettingsSource::new(ParserSettings {
            enable_autoupdate: true,
            update_interval_minutes: minutes,
        }))
    }

    fn scheduler(
        store: &Arc<InMemoryCoordinator>,
        settings: Arc<dyn ParserSettingsSource>,
        service: &Arc<CountingService>,
        ttl: Duration,
    ) -> ParserAutoupdateScheduler {
        ParserAutoupdateScheduler::new(
            store.clone(),
            settings,
            service.clone(),
            SchedulerConfig {
                lock_ttl: ttl,
                ..SchedulerConfig::default()
            },
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_instance_runs() {
        let (logs, _guard) = LogCapture::start();
        let store = Arc::new(InMemoryCoordinator::new());
        let (svc_a, svc_b) = (Arc::new(CountingService::default()), Arc::new(CountingService::default()));
        let a = scheduler(&store, enabled(60), &svc_a, SCHEDULER_LOCK_TTL);
        let b = scheduler(&store, enabled(60), &svc_b, SCHEDULER_LOCK_TTL);

        assert!(a.start().await);
        assert!(!b.start().await);
        settle().await;

        assert!(a.is_running().await);
        assert!(!b.is_running().await);
        assert_eq!(svc_a.runs.load(Ordering::SeqCst), 1);
        assert_eq!(svc_b.runs.load(Ordering::SeqCst), 0);
        assert_eq!(logs.count("Scheduler lock acquired"), 1);
        assert_eq!(logs.count("Scheduler lock NOT acquired"), 1);

        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_every_interval_and_keeps_lock() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let a = scheduler(&store, enabled(5), &svc, SCHEDULER_LOCK_TTL);

        assert!(a.start().await);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;

        // t=0, t=5m, t=10m
        assert_eq!(svc.runs.load(Ordering::SeqCst), 3);
        assert!(a.is_running().await);
        assert!(!store.try_acquire_lock(SCHEDULER_LOCK_KEY, "peer", SCHEDULER_LOCK_TTL).await.unwrap());

        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let a = scheduler(&store, enabled(60), &svc, SCHEDULER_LOCK_TTL);

        assert!(a.start().await);
        assert!(a.start().await);
        settle().await;
        assert_eq!(svc.runs.load(Ordering::SeqCst), 1);
        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_the_lock() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let a = scheduler(&store, enabled(60), &svc, SCHEDULER_LOCK_TTL);
        let b = scheduler(&store, enabled(60), &svc, SCHEDULER_LOCK_TTL);

        assert!(a.start().await);
        a.stop().await;
        assert!(!a.is_running().await);

        assert!(b.start().await);
        b.stop().await;
        assert!(store.get_value("lock:parser_autoupdate_scheduler").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lock_stops_the_loop_without_releasing_peer_lock() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let ttl = Duration::from_secs(10);
        let a = scheduler(&store, enabled(1), &svc, ttl);
        let b = scheduler(&store, enabled(1), &svc, ttl);

        assert!(a.start().await);
        settle().await;

        // Simulate the lock lapsing (e.g. a long partition).
        store.delete_value("lock:parser_autoupdate_scheduler").await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!a.is_running().await);

        assert!(b.start().await);
        a.stop().await;
        assert!(store.get_value("lock:parser_autoupdate_scheduler").await.unwrap().is_some());
        assert!(b.is_running().await);
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_holder_steps_down_when_a_peer_takes_over() {
        let (logs, _guard) = LogCapture::start();
        let store = Arc::new(InMemoryCoordinator::new());
        let (svc_a, svc_b) = (Arc::new(CountingService::default()), Arc::new(CountingService::default()));
        let ttl = Duration::from_secs(10);
        let a = scheduler(&store, enabled(1), &svc_a, ttl);
        let b = scheduler(&store, enabled(1), &svc_b, ttl);

        assert!(a.start().await);
        settle().await;

        // The lock lapses and a peer grabs it before A's next renewal.
        store.delete_value("lock:parser_autoupdate_scheduler").await.unwrap();
        assert!(b.start().await);

        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert!(!a.is_running().await);
        assert!(b.is_running().await);
        assert_eq!(svc_a.runs.load(Ordering::SeqCst), 1);
        assert!(svc_b.runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(logs.count("Failed to extend scheduler lock"), 1);

        a.stop().await;
        assert!(store.get_value("lock:parser_autoupdate_scheduler").await.unwrap().is_some());
        assert!(b.is_running().await);

        b.stop().await;
        assert!(store.get_value("lock:parser_autoupdate_scheduler").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_coordinator_keeps_scheduler_passive() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let a = scheduler(&store, enabled(60), &svc, SCHEDULER_LOCK_TTL);

        store.set_available(false);
        assert!(!a.start().await);
        settle().await;
        assert_eq!(svc.runs.load(Ordering::SeqCst), 0);

        // Stopping a scheduler that never started is a no-op.
        a.stop().await;
    }

    #[tokio::test]
    async fn run_once_disabled_reports_interval() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let settings = Arc::new(StaticSettingsSource::new(ParserSettings::default()));
        let a = scheduler(&store, settings, &svc, SCHEDULER_LOCK_TTL);

        let summary = a.run_once(false).await.unwrap();
        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            serde_json::json!({"status": "disabled", "interval_minutes": 60})
        );
        assert_eq!(svc.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_once_forced_runs_service_without_lock() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let settings = Arc::new(StaticSettingsSource::new(ParserSettings {
            enable_autoupdate: false,
            update_interval_minutes: 15,
        }));
        let a = scheduler(&store, settings, &svc, SCHEDULER_LOCK_TTL);

        // A peer holds the lock; manual runs do not care.
        store.try_acquire_lock(SCHEDULER_LOCK_KEY, "peer", SCHEDULER_LOCK_TTL).await.unwrap();

        let summary = a.run_once(true).await.unwrap();
        assert_eq!(summary.status, "ok");
        assert_eq!(summary.interval_minutes, 15);
        assert_eq!(svc.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycle_does_not_kill_the_loop() {
        let store = Arc::new(InMemoryCoordinator::new());
        let svc = Arc::new(CountingService::default());
        let a = scheduler(&store, Arc::new(BrokenSettings), &svc, SCHEDULER_LOCK_TTL);

        assert!(matches!(a.run_once(false).await, Err(SchedulerError::Settings(_))));

        assert!(a.start().await);
        tokio::time::sleep(Duration::from_secs(61 * 60)).await;
        assert!(a.is_running().await);
        a.stop().await;
    }
}
