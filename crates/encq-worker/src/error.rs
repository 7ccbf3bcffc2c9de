//! Worker error types.
//!
//! Every failure a worker attempt can hit comes from a collaborator
//! crate, so this is purely `#[from]` seams over their error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Storage error: {0}")]
    Storage(#[from] encq_storage::StorageError),

    #[error("Encode error: {0}")]
    Media(#[from] encq_media::MediaError),

    #[error("Registry error: {0}")]
    Registry(#[from] encq_registry::RegistryError),

    #[error("Broker error: {0}")]
    Broker(#[from] encq_broker::BrokerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
