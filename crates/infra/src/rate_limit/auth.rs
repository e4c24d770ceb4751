//! Login and token-refresh limits.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use kitsu_core::DomainError;

use super::{RateLimitError, RateLimitKey, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    Login,
    Refresh,
}

impl AuthScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScope::Login => "login",
            AuthScope::Refresh => "refresh",
        }
    }

    fn key(&self, identity: &str, client_ip: Option<&str>) -> Result<RateLimitKey, DomainError> {
        match self {
            // Emails are case-insensitive; `User@X` and `user@x` share a window.
            AuthScope::Login => {
                RateLimitKey::derive(self.as_str(), &identity.to_lowercase(), client_ip)
            }
            AuthScope::Refresh => RateLimitKey::derive(self.as_str(), identity, client_ip),
        }
    }
}

/// Failure of a guarded authentication attempt.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    InvalidKey(DomainError),

    #[error("attempt rejected: {0}")]
    Rejected(E),
}

impl<E> From<RateLimitError> for GuardError<E> {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::RateLimited => GuardError::RateLimited,
            RateLimitError::InvalidKey(e) => GuardError::InvalidKey(e),
        }
    }
}

/// Rate limits for the authentication endpoints.
///
/// One limiter (one failure policy) serves both scopes; the scope is part of
/// every key so login and refresh windows never share a counter.
///
/// `check_*` returns the key to pass to `record_*_failure` / `reset_*_limit`.
#[derive(Debug, Clone)]
pub struct AuthRateLimiter {
    limiter: RateLimiter,
}

impl AuthRateLimiter {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn check(
        &self,
        scope: AuthScope,
        identity: &str,
        client_ip: Option<&str>,
    ) -> Result<RateLimitKey, RateLimitError> {
        let key = scope.key(identity, client_ip)?;
        if self.limiter.is_limited(&key).await {
            debug!(scope = scope.as_str(), "auth attempt rate limited");
            return Err(RateLimitError::RateLimited);
        }
        Ok(key)
    }

    pub async fn check_login_rate_limit(
        &self,
        email: &str,
        client_ip: Option<&str>,
    ) -> Result<RateLimitKey, RateLimitError> {
        self.check(AuthScope::Login, email, client_ip).await
    }

    pub async fn record_login_failure(&self, key: &RateLimitKey) {
        self.limiter.record_failure(key).await
    }

    pub async fn reset_login_limit(&self, key: &RateLimitKey) {
        self.limiter.reset(key).await
    }

    pub async fn check_refresh_rate_limit(
        &self,
        token_identifier: &str,
        client_ip: Option<&str>,
    ) -> Result<RateLimitKey, RateLimitError> {
        self.check(AuthScope::Refresh, token_identifier, client_ip).await
    }

    pub async fn record_refresh_failure(&self, key: &RateLimitKey) {
        self.limiter.record_failure(key).await
    }

    pub async fn reset_refresh_limit(&self, key: &RateLimitKey) {
        self.limiter.reset(key).await
    }

    /// Run `attempt` behind the limit for `scope`.
    ///
    /// A limited caller never reaches `attempt`. A rejected attempt counts as a
    /// failure; a successful one clears the window.
    pub async fn guard<F, Fut, T, E>(
        &self,
        scope: AuthScope,
        identity: &str,
        client_ip: Option<&str>,
        attempt: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.check(scope, identity, client_ip).await?;
        match attempt().await {
            Ok(value) => {
                self.limiter.reset(&key).await;
                Ok(value)
            }
            Err(e) => {
                self.limiter.record_failure(&key).await;
                Err(GuardError::Rejected(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use crate::rate_limit::FailurePolicy;

    fn auth() -> AuthRateLimiter {
        let store = Arc::new(InMemoryCoordinator::new());
        AuthRateLimiter::new(RateLimiter::new(
            store,
            5,
            Duration::from_secs(60),
            FailurePolicy::FailClosed,
        ))
    }

    #[tokio::test]
    async fn login_limit_is_per_ip() {
        let auth = auth();
        let key = auth
            .check_login_rate_limit("user@example.com", Some("1.2.3.1"))
            .await
            .unwrap();
        for _ in 0..5 {
            auth.record_login_failure(&key).await;
        }

        assert_eq!(
            auth.check_login_rate_limit("user@example.com", Some("1.2.3.1")).await,
            Err(RateLimitError::RateLimited)
        );
        assert!(auth
            .check_login_rate_limit("user@example.com", Some("1.2.3.2"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn login_identity_is_case_insensitive() {
        let auth = auth();
        let a = auth.check_login_rate_limit("User@Example.com", None).await.unwrap();
        let b = auth.check_login_rate_limit("user@example.com", None).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn refresh_and_login_windows_are_separate() {
        let auth = auth();
        let login = auth.check_login_rate_limit("abc", Some("10.0.0.9")).await.unwrap();
        for _ in 0..5 {
            auth.record_login_failure(&login).await;
        }
        assert!(auth.check_refresh_rate_limit("abc", Some("10.0.0.9")).await.is_ok());
    }

    #[tokio::test]
    async fn reset_after_success() {
        let auth = auth();
        let key = auth.check_refresh_rate_limit("tok", None).await.unwrap();
        for _ in 0..5 {
            auth.record_refresh_failure(&key).await;
        }
        assert!(auth.check_refresh_rate_limit("tok", None).await.is_err());
        auth.reset_refresh_limit(&key).await;
        assert!(auth.check_refresh_rate_limit("tok", None).await.is_ok());
    }

    #[tokio::test]
    async fn empty_identity_is_invalid() {
        let auth = auth();
        assert!(matches!(
            auth.check_login_rate_limit("", None).await,
            Err(RateLimitError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn guard_counts_rejections_and_blocks_when_limited() {
        let auth = auth();
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let out: Result<(), GuardError<&str>> = auth
                .guard(AuthScope::Login, "user@example.com", Some("10.0.0.1"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad password")
                })
                .await;
            assert!(matches!(out, Err(GuardError::Rejected("bad password"))));
        }

        let out: Result<(), GuardError<&str>> = auth
            .guard(AuthScope::Login, "user@example.com", Some("10.0.0.1"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(GuardError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn guard_success_resets_window() {
        let auth = auth();
        for _ in 0..4 {
            let _: Result<(), GuardError<()>> = auth
                .guard(AuthScope::Login, "a@b.c", None, || async { Err(()) })
                .await;
        }
        let ok: Result<u8, GuardError<()>> = auth
            .guard(AuthScope::Login, "a@b.c", None, || async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);

        let key = auth.check_login_rate_limit("a@b.c", None).await.unwrap();
        assert_eq!(auth.limiter().attempts(&key).await.unwrap(), 0);
    }
}
