//! Cluster-wide mutual exclusion on top of the coordinator's conditional set.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kitsu_core::WorkerId;

use crate::coordinator::{Coordinator, CoordinatorError};

/// A named, TTL-bearing lock.
///
/// `acquire` is a single non-blocking attempt. The holder is expected to call
/// `extend` every [`renew_interval`](Self::renew_interval) and to stop its
/// exclusive work as soon as an extension fails.
///
/// Each instance writes its own owner token as the lock value; clones share
/// it. `extend` and `release` only touch the key while it still holds that
/// token, so a holder whose lock lapsed and was taken by a peer can neither
/// keep the peer's lock alive nor delete it.
#[derive(Clone)]
pub struct DistributedLock {
    coordinator: Arc<dyn Coordinator>,
    name: String,
    token: String,
    ttl: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(coordinator: Arc<dyn Coordinator>, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            coordinator,
            name: name.into(),
            token: WorkerId::new().token(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cadence at which a holder should call [`extend`](Self::extend).
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 2
    }

    /// Returns `true` iff this call now holds the lock.
    pub async fn acquire(&self) -> Result<bool, CoordinatorError> {
        self.coordinator
            .try_acquire_lock(&self.name, &self.token, self.ttl)
            .await
    }

    /// Returns `true` iff this holder's lock was deleted.
    pub async fn release(&self) -> Result<bool, CoordinatorError> {
        self.coordinator.release_lock(&self.name, &self.token).await
    }

    /// Reset the TTL. `false` means the lock expired or a peer now holds it.
    pub async fn extend(&self) -> Result<bool, CoordinatorError> {
        self.coordinator
            .extend_lock(&self.name, &self.token, self.ttl)
            .await
    }
}
