//! Job registry and dispatcher.
//!
//! This crate provides:
//! - The `JobStore` trait: source of truth for job status queries
//! - A Redis-backed store that survives process restarts
//! - An in-memory store for tests and single-process deployments
//! - The `Dispatcher`: validated submission, transactional
//!   insert-then-enqueue, and startup recovery of pending jobs

pub mod dispatcher;
pub mod error;
pub mod redis_store;
pub mod store;

pub use dispatcher::{Dispatcher, SubmitRequest};
pub use error::{RegistryError, RegistryResult};
pub use redis_store::{RedisJobStore, RedisRegistryConfig};
pub use store::{JobStore, MemoryJobStore};
