use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Coordinator operation error.
///
/// These are **infrastructure errors**: the shared store could not be reached
/// or refused a command. Components never bubble them up as crashes; each one
/// converts them into a policy decision (drop, reject, fail-open, fail-closed).
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("coordinator connection error: {0}")]
    Connection(String),

    #[error("coordinator command error: {0}")]
    Command(String),

    #[error("coordinator returned an invalid value: {0}")]
    InvalidValue(String),

    #[error("coordinator unavailable")]
    Unavailable,
}

/// Shared key-value store used as the single source of truth for
/// cross-process state.
///
/// Every call round-trips to the store; implementations must not cache values
/// locally, otherwise two worker processes could disagree about a lock or a
/// counter.
///
/// ## Key namespaces
///
/// - `lock:<name>`: managed by the lock primitives below (callers pass `<name>`)
/// - `counter:<name>`: global counters (e.g. `counter:global_jobs`)
/// - `job:status:<key>`: job status entries
/// - `rate_limit:<scope>:<name>`: rate-limit windows
///
/// ## TTL
///
/// TTLs are expressed to the store in whole seconds (see [`ttl_secs`]).
/// `None` means the key persists until deleted.
///
/// ## Atomicity
///
/// `set_value_if_absent`, `replace_value`, `increment_counter` (including its
/// first-increment TTL), `increment_if_below` and the three lock operations
/// must each be indivisible under concurrent callers from any number of
/// processes. Release and extension compare the owner token and act in one step.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Round-trip check that the store is reachable.
    async fn ping(&self) -> Result<(), CoordinatorError>;

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoordinatorError>;

    async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError>;

    /// Set `key` only if it does not exist. Returns `true` iff this call wrote it.
    async fn set_value_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError>;

    /// Overwrite `key` only if it currently holds `expected`.
    /// Returns `true` iff this call wrote it.
    async fn replace_value(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError>;

    async fn delete_value(&self, key: &str) -> Result<(), CoordinatorError>;

    /// Atomically increment `key` and return the new value.
    ///
    /// When `ttl` is given it is applied only by the increment that creates the
    /// key (new value == 1), which turns the counter into a fixed window.
    async fn increment_counter(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, CoordinatorError>;

    async fn decrement_counter(&self, key: &str) -> Result<i64, CoordinatorError>;

    /// Current counter value (0 if absent).
    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError>;

    /// Atomically increment `key` only if its current value is below `ceiling`.
    /// Returns `true` iff the increment happened.
    async fn increment_if_below(&self, key: &str, ceiling: i64) -> Result<bool, CoordinatorError>;

    /// Non-blocking "set if absent" of `token` on `lock:<name>` with a TTL.
    async fn try_acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError>;

    /// Delete `lock:<name>` if it still holds `token`. Returns `true` iff this
    /// call deleted it; anything else (absent, held by a peer) is a no-op.
    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CoordinatorError>;

    /// Reset the TTL of `lock:<name>` if it still holds `token`. Returns
    /// `false` if the lock expired or now belongs to someone else.
    async fn extend_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError>;
}

/// Storage key for a named lock.
pub fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

/// TTL in whole seconds, rounded up, never below one second.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl<C> Coordinator for Arc<C>
where
    C: Coordinator + ?Sized,
{
    async fn ping(&self) -> Result<(), CoordinatorError> {
        (**self).ping().await
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoordinatorError> {
        (**self).get_value(key).await
    }

    async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError> {
        (**self).set_value(key, value, ttl).await
    }

    async fn set_value_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        (**self).set_value_if_absent(key, value, ttl).await
    }

    async fn replace_value(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        (**self).replace_value(key, expected, value, ttl).await
    }

    async fn delete_value(&self, key: &str) -> Result<(), CoordinatorError> {
        (**self).delete_value(key).await
    }

    async fn increment_counter(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, CoordinatorError> {
        (**self).increment_counter(key, ttl).await
    }

    async fn decrement_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        (**self).decrement_counter(key).await
    }

    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        (**self).get_counter(key).await
    }

    async fn increment_if_below(&self, key: &str, ceiling: i64) -> Result<bool, CoordinatorError> {
        (**self).increment_if_below(key, ceiling).await
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        (**self).try_acquire_lock(name, token, ttl).await
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CoordinatorError> {
        (**self).release_lock(name, token).await
    }

    async fn extend_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        (**self).extend_lock(name, token, ttl).await
    }
}
