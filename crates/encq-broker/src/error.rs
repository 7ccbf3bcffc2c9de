//! Broker error types.

use thiserror::Error;

use encq_models::JobId;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Ack/nack for a delivery the broker does not consider active.
    /// Double delivery or a lost acknowledgment; a bug if ever observed.
    #[error("broker invariant violated: unknown delivery {0}")]
    UnknownDelivery(u64),

    /// Enqueue of a job that is already pending or actively delivered.
    #[error("broker invariant violated: job {0} is already queued or active")]
    DuplicateJob(JobId),

    /// The broker has been shut down.
    #[error("broker is shut down")]
    Closed,
}

impl BrokerError {
    /// True for the fatal-bug class of errors (never expected in correct
    /// operation).
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            BrokerError::UnknownDelivery(_) | BrokerError::DuplicateJob(_)
        )
    }
}
