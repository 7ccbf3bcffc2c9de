//! Job submission dispatcher.

use std::sync::Arc;

use tracing::{error, info, warn};

use encq_broker::QueueBroker;
use encq_models::{
    extension_matches_kind, routing::validate_priority, EncodeParams, Job, JobId, JobKind,
    RoutingKey, ValidationError, DEFAULT_PRIORITY,
};

use crate::error::RegistryResult;
use crate::store::JobStore;

/// A validated-on-entry job submission. Optional fields fall back to the
/// documented defaults (priority 5, routing key All, per-kind params).
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub input_locator: String,
    pub params: Option<EncodeParams>,
    pub priority: Option<u8>,
    pub routing_key: Option<RoutingKey>,
}

impl SubmitRequest {
    pub fn new(kind: JobKind, input_locator: impl Into<String>) -> Self {
        Self {
            kind,
            input_locator: input_locator.into(),
            params: None,
            priority: None,
            routing_key: None,
        }
    }

    pub fn with_params(mut self, params: EncodeParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_routing_key(mut self, key: RoutingKey) -> Self {
        self.routing_key = Some(key);
        self
    }
}

/// Accepts submissions, persists them to the registry and places them on
/// the broker. Owns no state of its own; both collaborators are injected.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<QueueBroker>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<QueueBroker>) -> Self {
        Self { store, broker }
    }

    /// Validate and submit a job. Validation failures reject the request
    /// before any side effect: no registry write, no enqueue.
    ///
    /// Insert-then-enqueue is transactional: if the enqueue fails, the
    /// Pending record is rolled back so it cannot dangle unqueued.
    pub async fn submit(&self, request: SubmitRequest) -> RegistryResult<JobId> {
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        let routing_key = request.routing_key.unwrap_or_default();
        let params = request
            .params
            .unwrap_or_else(|| EncodeParams::default_for(request.kind));

        validate_priority(priority)?;
        params.validate()?;
        if params.kind() != request.kind {
            return Err(ValidationError::ParamOutOfRange {
                field: "params".to_string(),
                detail: format!(
                    "{} params on a {} job",
                    params.kind(),
                    request.kind
                ),
            }
            .into());
        }
        if !extension_matches_kind(&request.input_locator, request.kind) {
            return Err(ValidationError::UnsupportedExtension {
                kind: request.kind,
                locator: request.input_locator,
            }
            .into());
        }

        let job = Job::new(
            request.kind,
            request.input_locator,
            params,
            priority,
            routing_key,
        );
        let id = job.id.clone();

        self.store.insert(&job).await?;

        if let Err(enqueue_err) = self.broker.enqueue(job) {
            // A Pending record that was never enqueued must not survive.
            if let Err(rollback_err) = self.store.remove(&id).await {
                error!(
                    job_id = %id,
                    %enqueue_err,
                    %rollback_err,
                    "Enqueue failed and rollback failed; record may dangle"
                );
            }
            return Err(enqueue_err.into());
        }

        info!(
            job_id = %id,
            priority,
            routing_key = %routing_key,
            "Job submitted"
        );
        Ok(id)
    }

    /// Look up a job by id.
    pub async fn get(&self, id: &JobId) -> RegistryResult<Job> {
        self.store.get(id).await
    }

    /// Re-enqueue every unfinished job found in the store. Called once at
    /// startup; the registry plus this pass is the broker's durability
    /// story across full-process restarts.
    ///
    /// Running jobs are included: a job that was mid-delivery when the
    /// previous process died lost its delivery with the broker, so it
    /// goes back in its queue. The store stays Running for it and the
    /// next `mark_running` is idempotent.
    pub async fn recover(&self) -> RegistryResult<usize> {
        let mut unfinished = self.store.list_pending().await?;
        unfinished.extend(self.store.list_running().await?);
        let mut recovered = 0;

        for job in unfinished {
            let id = job.id.clone();
            match self.broker.enqueue(job) {
                Ok(()) => recovered += 1,
                // Already enqueued (e.g. recover raced a live dispatcher).
                Err(encq_broker::BrokerError::DuplicateJob(_)) => {}
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to recover pending job");
                    return Err(e.into());
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "Re-enqueued unfinished jobs from registry");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::store::MemoryJobStore;
    use encq_broker::BrokerConfig;
    use encq_models::{ImageParams, JobStatus, VideoParams};

    fn dispatcher() -> (Dispatcher, Arc<MemoryJobStore>, Arc<QueueBroker>) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(QueueBroker::new(BrokerConfig::default()));
        let dispatcher = Dispatcher::new(store.clone(), broker.clone());
        (dispatcher, store, broker)
    }

    #[tokio::test]
    async fn submit_writes_pending_record_and_enqueues() {
        let (dispatcher, store, broker) = dispatcher();

        let id = dispatcher
            .submit(
                SubmitRequest::new(JobKind::Image, "input/abc_photo.png")
                    .with_params(EncodeParams::Image(ImageParams {
                        compression_level: 9,
                    })),
            )
            .await
            .unwrap();

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.output_locator, "output/abc_encoded_photo.webp");
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(broker.depth(RoutingKey::All), 1);
    }

    #[tokio::test]
    async fn out_of_range_priority_leaves_no_trace() {
        let (dispatcher, store, broker) = dispatcher();

        let err = dispatcher
            .submit(SubmitRequest::new(JobKind::Image, "input/abc_photo.png").with_priority(11))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        assert!(store.list_pending().await.unwrap().is_empty());
        assert_eq!(broker.depth(RoutingKey::All), 0);
    }

    #[tokio::test]
    async fn out_of_range_params_rejected() {
        let (dispatcher, _, _) = dispatcher();

        let err = dispatcher
            .submit(
                SubmitRequest::new(JobKind::Video, "input/abc_clip.mkv")
                    .with_params(EncodeParams::Video(VideoParams { preset: 14, crf: 2 })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn params_must_match_kind() {
        let (dispatcher, _, _) = dispatcher();

        let err = dispatcher
            .submit(
                SubmitRequest::new(JobKind::Video, "input/abc_clip.mkv")
                    .with_params(EncodeParams::Image(ImageParams::default())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn unsupported_extension_rejected() {
        let (dispatcher, store, _) = dispatcher();

        let err = dispatcher
            .submit(SubmitRequest::new(JobKind::Video, "input/abc_photo.gif"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::UnsupportedExtension { .. })
        ));
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_rolls_back_registry_write() {
        let (dispatcher, store, broker) = dispatcher();
        broker.shutdown();

        let err = dispatcher
            .submit(SubmitRequest::new(JobKind::Image, "input/abc_photo.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Enqueue(_)));

        // No Pending job dangles after the rollback.
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_requeues_pending_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(QueueBroker::new(BrokerConfig::default()));

        // A job persisted by a previous process that never got worked.
        let orphan = Job::new(
            JobKind::Image,
            "input/abc_photo.png",
            EncodeParams::default_for(JobKind::Image),
            7,
            RoutingKey::High,
        );
        store.insert(&orphan).await.unwrap();

        let dispatcher = Dispatcher::new(store, broker.clone());
        assert_eq!(dispatcher.recover().await.unwrap(), 1);
        assert_eq!(broker.depth(RoutingKey::High), 1);

        // Idempotent: a second pass finds it already enqueued.
        assert_eq!(dispatcher.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_requeues_jobs_lost_mid_delivery() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(QueueBroker::new(BrokerConfig::default()));

        // A job that was Running when the previous process died: its
        // delivery vanished with that process's broker.
        let stranded = Job::new(
            JobKind::Video,
            "input/abc_clip.mkv",
            EncodeParams::default_for(JobKind::Video),
            5,
            RoutingKey::All,
        );
        store.insert(&stranded).await.unwrap();
        store
            .mark_running(&stranded.id, chrono::Utc::now(), 1)
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), broker.clone());
        assert_eq!(dispatcher.recover().await.unwrap(), 1);
        assert_eq!(broker.depth(RoutingKey::All), 1);

        // The redelivery claims it again; the Running record tolerates it.
        let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();
        assert_eq!(d.job.id, stranded.id);
        let job = store
            .mark_running(&stranded.id, chrono::Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }
}
