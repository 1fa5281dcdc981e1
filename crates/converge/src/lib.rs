//! Steward converge: the ownership-based convergence engine.
//!
//! A controller declares which objects should exist because of an owner; [`Converger`] creates,
//! updates and garbage collects dependents until the store matches, honouring claims held by
//! other owners. [`wait_until`] blocks until an object reaches a state, for tests and setup code.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod index;
pub mod retry;
pub mod wait;

pub use config::ConvergeConfig;
pub use engine::{ConvergeError, ConvergeReport, Converger, MergeFn};
pub use index::{OwnerIndex, OWNER_INDEX};
pub use retry::{retry_with_backoff, RetryConfig};
pub use wait::{ready, wait_until, wait_until_not_found, Predicate, WaitError, WaitOptions};
