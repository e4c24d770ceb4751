//! Infrastructure layer: coordination store, locks, rate limits, jobs,
//! scheduling and configuration.

pub mod config;
pub mod coordinator;
pub mod jobs;
pub mod lock;
pub mod rate_limit;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{Coordinator, CoordinatorError, InMemoryCoordinator};
pub use lock::DistributedLock;

#[cfg(feature = "redis")]
pub use coordinator::RedisCoordinator;
