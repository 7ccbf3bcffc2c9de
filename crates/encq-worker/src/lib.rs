//! Worker pool and cluster status aggregation.
//!
//! A `Worker` consumes deliveries from the broker, runs the
//! download/encode/upload pipeline for each, and settles every delivery
//! with an ack or nack. The `WorkerDirectory` tracks live workers; the
//! `ClusterStatusAggregator` probes them for a read-only snapshot of
//! pool load. The dead-letter reaper turns exhausted retry budgets into
//! terminal Failed records.

pub mod config;
pub mod directory;
pub mod error;
pub mod executor;
pub mod reaper;

pub use config::WorkerConfig;
pub use directory::{
    Availability, ClusterStatus, ClusterStatusAggregator, StatusProbe, WorkerDirectory,
    WorkerStatus,
};
pub use error::{WorkerError, WorkerResult};
pub use executor::Worker;
pub use reaper::spawn_dead_letter_reaper;
