//! Configuration loading and representation.
//!
//! Everything comes from environment variables; every variable has a default
//! so a bare `kitsu-api` starts a single-process dev setup.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::{JobDefaults, JobRunnerConfig};
use crate::rate_limit::FailurePolicy;
use crate::scheduler::{ParserSettings, SchedulerConfig, DEFAULT_INTERVAL_MINUTES};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Display) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobsSettings {
    pub max_running: i64,
    pub queue_capacity: usize,
    pub defaults: JobDefaults,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    pub max_attempts: u32,
    pub window: Duration,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` selects the in-memory coordinator (single process only).
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    /// Peers whose `X-Forwarded-For` is believed. Empty: the socket address
    /// is the client.
    pub trusted_proxies: Vec<IpAddr>,
    /// Parsed by the binary (`json` or `pretty`).
    pub log_format: String,
    pub jobs: JobsSettings,
    pub scheduler_lock_ttl: Duration,
    pub parser: ParserSettings,
    pub auth_rate_limit: RateLimitSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let max_running: i64 = env.parse("JOBS_MAX_RUNNING", 20)?;
        if max_running < 1 {
            return Err(ConfigError::invalid("JOBS_MAX_RUNNING", &max_running.to_string(), "must be at least 1"));
        }

        let queue_capacity: usize = env.parse("JOBS_QUEUE_CAPACITY", 1024)?;
        if queue_capacity == 0 {
            return Err(ConfigError::invalid("JOBS_QUEUE_CAPACITY", "0", "must be at least 1"));
        }

        let max_attempts: u32 = env.parse("JOBS_DEFAULT_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::invalid("JOBS_DEFAULT_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let backoff = env.seconds_f64("JOBS_DEFAULT_BACKOFF_SECONDS", 1.0)?;
        let scheduler_lock_ttl = Duration::from_secs(env.positive("SCHEDULER_LOCK_TTL_SECONDS", 90)?);

        let parser = ParserSettings {
            enable_autoupdate: env.flag("PARSER_AUTOUPDATE_ENABLED", false)?,
            update_interval_minutes: env.parse(
                "PARSER_UPDATE_INTERVAL_MINUTES",
                DEFAULT_INTERVAL_MINUTES as i64,
            )?,
        };

        let auth_rate_limit = RateLimitSettings {
            max_attempts: env.positive("AUTH_RATE_LIMIT_MAX_ATTEMPTS", 5)? as u32,
            window: Duration::from_secs(env.positive("AUTH_RATE_LIMIT_WINDOW_SECONDS", 60)?),
            failure_policy: env.parse("AUTH_RATE_LIMIT_FAILURE_POLICY", FailurePolicy::FailClosed)?,
        };

        Ok(Self {
            redis_url: env.get("REDIS_URL"),
            bind_addr: env.parse("KITSU_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            trusted_proxies: env.list("KITSU_TRUSTED_PROXIES")?,
            log_format: env.get("KITSU_LOG_FORMAT").unwrap_or_else(|| "json".to_string()),
            jobs: JobsSettings {
                max_running,
                queue_capacity,
                defaults: JobDefaults {
                    max_attempts,
                    backoff,
                },
            },
            scheduler_lock_ttl,
            parser,
            auth_rate_limit,
        })
    }

    pub fn runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig::default()
            .with_max_running_jobs(self.jobs.max_running)
            .with_queue_capacity(self.jobs.queue_capacity)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lock_ttl: self.scheduler_lock_ttl,
            ..SchedulerConfig::default()
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Unset and blank are the same thing.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| ConfigError::invalid(var, &raw, e)),
        }
    }

    /// Comma-separated values; unset means empty.
    fn list<T>(&self, var: &'static str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.get(var) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| item.parse().map_err(|e| ConfigError::invalid(var, item, e)))
            .collect()
    }

    fn positive(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value: u64 = self.parse(var, default)?;
        if value == 0 {
            return Err(ConfigError::invalid(var, "0", "must be at least 1"));
        }
        Ok(value)
    }

    fn seconds_f64(&self, var: &'static str, default: f64) -> Result<Duration, ConfigError> {
        let secs: f64 = self.parse(var, default)?;
        Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::invalid(var, &secs.to_string(), e))
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(var, &raw, "expected a boolean")),
            },
        }
    }
}
