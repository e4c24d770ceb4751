use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::r#trait::{lock_key, ttl_secs, Coordinator, CoordinatorError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: impl Into<String>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.into(),
            expires_at: ttl.map(|t| now + Duration::from_secs(ttl_secs(t))),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    fn as_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        self.value
            .parse::<i64>()
            .map_err(|_| CoordinatorError::InvalidValue(format!("{key} is not an integer")))
    }
}

/// In-memory coordinator.
///
/// Intended for tests/dev and single-process deployments: it only coordinates
/// tasks inside one process. Expiry follows `tokio::time`, so tests running
/// with a paused clock can move past a TTL with `tokio::time::advance`.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`CoordinatorError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key (`None` if absent or persistent).
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable);
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoordinatorError::Command("lock poisoned".to_string()))?;

        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        f(&mut entries, now)
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn ping(&self) -> Result<(), CoordinatorError> {
        self.with_entries(|_, _| Ok(()))
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, CoordinatorError> {
        self.with_entries(|entries, _| Ok(entries.get(key).map(|e| e.value.clone())))
    }

    async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError> {
        self.with_entries(|entries, now| {
            entries.insert(key.to_string(), Entry::new(value, ttl, now));
            Ok(())
        })
    }

    async fn set_value_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(key.to_string(), Entry::new(value, ttl, now));
            Ok(true)
        })
    }

    async fn replace_value(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        self.with_entries(|entries, now| match entries.get(key) {
            Some(current) if current.value == expected => {
                entries.insert(key.to_string(), Entry::new(value, ttl, now));
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn delete_value(&self, key: &str) -> Result<(), CoordinatorError> {
        self.with_entries(|entries, _| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn increment_counter(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, CoordinatorError> {
        self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                let next = entry.as_counter(key)? + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(key.to_string(), Entry::new("1", ttl, now));
                Ok(1)
            }
        })
    }

    async fn decrement_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                let next = entry.as_counter(key)? - 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(key.to_string(), Entry::new("-1", None, now));
                Ok(-1)
            }
        })
    }

    async fn get_counter(&self, key: &str) -> Result<i64, CoordinatorError> {
        self.with_entries(|entries, _| match entries.get(key) {
            Some(entry) => entry.as_counter(key),
            None => Ok(0),
        })
    }

    async fn increment_if_below(&self, key: &str, ceiling: i64) -> Result<bool, CoordinatorError> {
        self.with_entries(|entries, _| {
            let current = match entries.get(key) {
                Some(entry) => entry.as_counter(key)?,
                None => 0,
            };
            if current >= ceiling {
                return Ok(false);
            }
            let expires_at = entries.get(key).and_then(|e| e.expires_at);
            entries.insert(
                key.to_string(),
                Entry {
                    value: (current + 1).to_string(),
                    expires_at,
                },
            );
            Ok(true)
        })
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        self.set_value_if_absent(&lock_key(name), token, Some(ttl)).await
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CoordinatorError> {
        let key = lock_key(name);
        self.with_entries(|entries, _| match entries.get(&key) {
            Some(entry) if entry.value == token => {
                entries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn extend_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        let key = lock_key(name);
        self.with_entries(|entries, now| match entries.get_mut(&key) {
            Some(entry) if entry.value == token => {
                entry.expires_at = Some(now + Duration::from_secs(ttl_secs(ttl)));
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}
