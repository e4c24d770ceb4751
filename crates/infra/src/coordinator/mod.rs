//! Shared coordination store boundary.
//!
//! Every cross-process decision (locks, admission counters, job statuses,
//! rate-limit windows) goes through a [`Coordinator`]. Two backends exist:
//! an in-process store for tests/dev and a Redis-backed one behind the
//! `redis` feature.

pub mod in_memory;
pub mod r#trait;

#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCoordinator;
pub use r#trait::{lock_key, ttl_secs, Coordinator, CoordinatorError};

#[cfg(feature = "redis")]
pub use self::redis::RedisCoordinator;
