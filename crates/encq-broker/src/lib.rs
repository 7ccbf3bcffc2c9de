//! In-process job broker.
//!
//! This crate provides:
//! - One priority-ordered queue per routing key
//! - At-most-one-active-delivery semantics per job
//! - Lease timeouts with automatic requeue (at-least-once delivery)
//! - Retry accounting with a dead-letter channel after budget exhaustion

pub mod broker;
pub mod error;

pub use broker::{
    BrokerConfig, DeadLetter, Delivery, DeliveryId, NackOutcome, QueueBroker,
};
pub use error::{BrokerError, BrokerResult};
