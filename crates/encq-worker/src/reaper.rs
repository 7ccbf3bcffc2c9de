//! Dead-letter reaper.
//!
//! Jobs that exhaust their retry budget leave the broker on the
//! dead-letter channel. The reaper records the terminal failure in the
//! registry so the job stays queryable instead of vanishing.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use encq_broker::QueueBroker;
use encq_registry::JobStore;

/// Consume the broker's dead-letter channel, marking each job Failed.
/// Returns `None` if the channel was already taken. The task exits when
/// the broker is dropped and the channel closes.
pub fn spawn_dead_letter_reaper(
    broker: &Arc<QueueBroker>,
    store: Arc<dyn JobStore>,
) -> Option<JoinHandle<()>> {
    let mut dead_rx = broker.take_dead_letters()?;

    Some(tokio::spawn(async move {
        while let Some(dead) = dead_rx.recv().await {
            let detail = format!("failed after {} attempts: {}", dead.attempts, dead.error);
            match store.mark_failed(&dead.job.id, Utc::now(), &detail).await {
                Ok(_) => {
                    warn!(
                        job_id = %dead.job.id,
                        attempts = dead.attempts,
                        "Job failed permanently: {}", dead.error
                    );
                }
                Err(e) => {
                    error!(
                        job_id = %dead.job.id,
                        "Failed to record dead-lettered job: {}", e
                    );
                }
            }
        }
    }))
}
