//! `kitsu-core`: shared primitives for the background coordination layer.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobKey, WorkerId};
