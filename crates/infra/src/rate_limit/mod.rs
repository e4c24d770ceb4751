//! Fixed-window attempt limiting backed by coordinator counters.
//!
//! A window starts at the first recorded failure (the counter TTL is set only
//! when the count becomes 1) and lasts `window`; later failures never extend it.
//!
//! When the coordinator is unreachable, [`RateLimiter::is_limited`] resolves
//! through the instance's [`FailurePolicy`]. Each limiter picks exactly one
//! policy at construction.

pub mod auth;
pub mod key;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use kitsu_core::DomainError;

use crate::coordinator::{Coordinator, CoordinatorError};

pub use auth::{AuthRateLimiter, AuthScope, GuardError};
pub use key::RateLimitKey;

pub const RATE_LIMIT_MESSAGE: &str = "Too many attempts, try again later";

const KEY_PREFIX: &str = "rate_limit";

/// What an unreachable coordinator means for a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "open",
            FailurePolicy::FailClosed => "closed",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail_open" | "fail-open" => Ok(FailurePolicy::FailOpen),
            "closed" | "fail_closed" | "fail-closed" => Ok(FailurePolicy::FailClosed),
            other => Err(DomainError::validation(format!(
                "unknown rate-limit failure policy: {other}"
            ))),
        }
    }
}

/// Outcome of a limit check that did not let the caller through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    InvalidKey(#[from] DomainError),
}

#[derive(Clone)]
pub struct RateLimiter {
    coordinator: Arc<dyn Coordinator>,
    max_attempts: u32,
    window: Duration,
    failure_policy: FailurePolicy,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_attempts", &self.max_attempts)
            .field("window", &self.window)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        max_attempts: u32,
        window: Duration,
        failure_policy: FailurePolicy,
    ) -> Self {
        info!(
            max_attempts,
            window_secs = window.as_secs(),
            failure_policy = %failure_policy,
            "rate limiter configured"
        );
        Self {
            coordinator,
            max_attempts,
            window,
            failure_policy,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn counter_key(key: &RateLimitKey) -> String {
        format!("{KEY_PREFIX}:{key}")
    }

    /// Failures recorded in the current window.
    pub async fn attempts(&self, key: &RateLimitKey) -> Result<i64, CoordinatorError> {
        self.coordinator.get_counter(&Self::counter_key(key)).await
    }

    pub async fn is_limited(&self, key: &RateLimitKey) -> bool {
        match self.attempts(key).await {
            Ok(count) => count >= i64::from(self.max_attempts),
            Err(e) => {
                let limited = self.failure_policy == FailurePolicy::FailClosed;
                warn!(
                    scope = key.scope(),
                    failure_policy = %self.failure_policy,
                    limited,
                    error = %e,
                    "rate limit check failed; applying failure policy"
                );
                limited
            }
        }
    }

    pub async fn record_failure(&self, key: &RateLimitKey) {
        match self
            .coordinator
            .increment_counter(&Self::counter_key(key), Some(self.window))
            .await
        {
            Ok(count) if count >= i64::from(self.max_attempts) => {
                info!(scope = key.scope(), attempts = count, "rate limit reached");
            }
            Ok(_) => {}
            Err(e) => warn!(scope = key.scope(), error = %e, "failed to record rate-limit failure"),
        }
    }

    pub async fn reset(&self, key: &RateLimitKey) {
        if let Err(e) = self.coordinator.delete_value(&Self::counter_key(key)).await {
            warn!(scope = key.scope(), error = %e, "failed to reset rate limit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;

    fn limiter(policy: FailurePolicy) -> (Arc<InMemoryCoordinator>, RateLimiter) {
        let store = Arc::new(InMemoryCoordinator::new());
        let limiter = RateLimiter::new(store.clone(), 5, Duration::from_secs(60), policy);
        (store, limiter)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::derive("login", "user@example.com", Some("1.2.3.1")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn limited_after_max_failures_until_window_expires() {
        let (_store, limiter) = limiter(FailurePolicy::FailClosed);
        let key = key();

        for _ in 0..4 {
            limiter.record_failure(&key).await;
        }
        assert!(!limiter.is_limited(&key).await);

        limiter.record_failure(&key).await;
        assert!(limiter.is_limited(&key).await);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.is_limited(&key).await);
        assert_eq!(limiter.attempts(&key).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_failures_do_not_extend_the_window() {
        let (store, limiter) = limiter(FailurePolicy::FailClosed);
        let key = key();

        limiter.record_failure(&key).await;
        tokio::time::advance(Duration::from_secs(50)).await;
        limiter.record_failure(&key).await;

        let ttl = store.ttl_of(&format!("rate_limit:{key}")).unwrap();
        assert_eq!(ttl, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn reset_clears_the_penalty() {
        let (_store, limiter) = limiter(FailurePolicy::FailClosed);
        let key = key();
        for _ in 0..5 {
            limiter.record_failure(&key).await;
        }
        assert!(limiter.is_limited(&key).await);

        limiter.reset(&key).await;
        assert!(!limiter.is_limited(&key).await);
    }

    #[tokio::test]
    async fn unreachable_store_follows_policy() {
        let (open_store, open) = limiter(FailurePolicy::FailOpen);
        let (closed_store, closed) = limiter(FailurePolicy::FailClosed);
        open_store.set_available(false);
        closed_store.set_available(false);

        assert!(!open.is_limited(&key()).await);
        assert!(closed.is_limited(&key()).await);

        // Recording and resetting never panic or propagate.
        closed.record_failure(&key()).await;
        closed.reset(&key()).await;
    }

    #[test]
    fn policy_parses() {
        assert_eq!("open".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailOpen);
        assert_eq!(" Closed ".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailClosed);
        assert_eq!("fail-open".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailOpen);
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn rate_limited_message_is_user_facing() {
        assert_eq!(RateLimitError::RateLimited.to_string(), RATE_LIMIT_MESSAGE);
    }
}
