//! Boundaries the scheduler consumes: where parser settings come from and
//! what actually runs on each tick.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;

/// Parser settings relevant to autoupdate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserSettings {
    pub enable_autoupdate: bool,
    /// Non-positive values fall back to [`DEFAULT_INTERVAL_MINUTES`].
    pub update_interval_minutes: i64,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            enable_autoupdate: false,
            update_interval_minutes: DEFAULT_INTERVAL_MINUTES as i64,
        }
    }
}

pub fn resolve_update_interval_minutes(settings: &ParserSettings) -> u64 {
    u64::try_from(settings.update_interval_minutes)
        .ok()
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_INTERVAL_MINUTES)
}

/// Result of one autoupdate run, as surfaced to admin endpoints.
///
/// Serializes flat: `{"status": ..., "interval_minutes": ..., <extra>...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoupdateSummary {
    pub status: String,
    pub interval_minutes: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AutoupdateSummary {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            extra: Map::new(),
        }
    }

    pub fn disabled(interval_minutes: u64) -> Self {
        Self {
            interval_minutes,
            ..Self::new("disabled")
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait ParserSettingsSource: Send + Sync {
    async fn load(&self) -> anyhow::Result<ParserSettings>;
}

/// The job-producing service invoked once per scheduler tick.
#[async_trait]
pub trait AutoupdateService: Send + Sync {
    async fn run(&self, settings: &ParserSettings, force: bool) -> anyhow::Result<AutoupdateSummary>;
}

/// Settings held in memory (seeded from configuration).
#[derive(Debug, Default)]
pub struct StaticSettingsSource {
    settings: RwLock<ParserSettings>,
}

impl StaticSettingsSource {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> ParserSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, settings: ParserSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[async_trait]
impl ParserSettingsSource for StaticSettingsSource {
    async fn load(&self) -> anyhow::Result<ParserSettings> {
        Ok(self.current())
    }
}
