//! Job store trait and in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use encq_models::{Job, JobId, JobStatus};

use crate::error::{RegistryError, RegistryResult};

/// Source of truth for job submission and status queries.
///
/// Status writes are serialized per job id by the callers' one-active-
/// delivery discipline: exactly one worker holds a job's delivery, so no
/// two writers race on the same record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created Pending job.
    async fn insert(&self, job: &Job) -> RegistryResult<()>;

    /// Fetch a job by id.
    async fn get(&self, id: &JobId) -> RegistryResult<Job>;

    /// Transition to Running; sets `started_at` exactly once and records
    /// the delivery attempt. Redelivery of the same job is idempotent.
    async fn mark_running(&self, id: &JobId, at: DateTime<Utc>, attempt: u32)
        -> RegistryResult<Job>;

    /// Transition to Succeeded; sets `completed_at` exactly once.
    async fn mark_succeeded(&self, id: &JobId, at: DateTime<Utc>) -> RegistryResult<Job>;

    /// Transition to Failed with a human-readable error detail.
    async fn mark_failed(&self, id: &JobId, at: DateTime<Utc>, detail: &str)
        -> RegistryResult<Job>;

    /// Remove a record entirely (submission rollback).
    async fn remove(&self, id: &JobId) -> RegistryResult<()>;

    /// All jobs still in Pending state, for startup recovery.
    async fn list_pending(&self) -> RegistryResult<Vec<Job>>;

    /// All jobs in Running state. After a full-process crash these lost
    /// their delivery with the broker; recovery re-enqueues them.
    async fn list_running(&self) -> RegistryResult<Vec<Job>>;
}

/// Apply a status transition to a job record, enforcing monotonicity.
/// Shared by every store implementation.
pub(crate) fn apply_transition(
    mut job: Job,
    to: JobStatus,
    at: DateTime<Utc>,
    detail: Option<&str>,
    attempt: Option<u32>,
) -> RegistryResult<Job> {
    // Same-status writes are idempotent (a requeued job is still Running
    // from the registry's point of view when the next worker claims it).
    if job.status != to && !job.status.can_transition_to(to) {
        return Err(RegistryError::InvalidTransition {
            id: job.id.clone(),
            from: job.status,
            to,
        });
    }

    job.status = to;
    match to {
        JobStatus::Running => {
            if job.started_at.is_none() {
                job.started_at = Some(at);
            }
            if let Some(attempt) = attempt {
                job.retry_count = attempt.saturating_sub(1);
            }
        }
        JobStatus::Succeeded => {
            if job.completed_at.is_none() {
                job.completed_at = Some(at);
            }
        }
        JobStatus::Failed => {
            if job.completed_at.is_none() {
                job.completed_at = Some(at);
            }
            if let Some(detail) = detail {
                job.error_detail = Some(detail.to_string());
            }
        }
        JobStatus::Pending => {}
    }
    Ok(job)
}

/// In-memory job store. Used by tests; also fine for a single-process
/// deployment that does not need restart durability.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(
        &self,
        id: &JobId,
        to: JobStatus,
        at: DateTime<Utc>,
        detail: Option<&str>,
        attempt: Option<u32>,
    ) -> RegistryResult<Job> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let updated = apply_transition(current, to, at, detail, attempt)?;
        jobs.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    async fn list_with_status(&self, status: JobStatus) -> RegistryResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> RegistryResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> RegistryResult<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    async fn mark_running(
        &self,
        id: &JobId,
        at: DateTime<Utc>,
        attempt: u32,
    ) -> RegistryResult<Job> {
        self.update(id, JobStatus::Running, at, None, Some(attempt))
            .await
    }

    async fn mark_succeeded(&self, id: &JobId, at: DateTime<Utc>) -> RegistryResult<Job> {
        self.update(id, JobStatus::Succeeded, at, None, None).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        at: DateTime<Utc>,
        detail: &str,
    ) -> RegistryResult<Job> {
        self.update(id, JobStatus::Failed, at, Some(detail), None)
            .await
    }

    async fn remove(&self, id: &JobId) -> RegistryResult<()> {
        self.jobs.write().await.remove(id);
        Ok(())
    }

    async fn list_pending(&self) -> RegistryResult<Vec<Job>> {
        self.list_with_status(JobStatus::Pending).await
    }

    async fn list_running(&self) -> RegistryResult<Vec<Job>> {
        self.list_with_status(JobStatus::Running).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encq_models::{EncodeParams, JobKind, RoutingKey};

    fn job() -> Job {
        Job::new(
            JobKind::Image,
            "input/abc_photo.png",
            EncodeParams::default_for(JobKind::Image),
            5,
            RoutingKey::All,
        )
    }

    #[tokio::test]
    async fn lifecycle_through_store() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(&j).await.unwrap();

        let now = Utc::now();
        let running = store.mark_running(&j.id, now, 1).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.started_at, Some(now));

        let done = store.mark_succeeded(&j.id, now).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.completed_at, Some(now));
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(&j).await.unwrap();

        let now = Utc::now();
        store.mark_running(&j.id, now, 1).await.unwrap();
        store.mark_succeeded(&j.id, now).await.unwrap();

        let err = store.mark_failed(&j.id, now, "late failure").await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let err = store.mark_running(&j.id, now, 2).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn started_at_set_exactly_once() {
        let store = MemoryJobStore::new();
        let j = job();
        store.insert(&j).await.unwrap();

        let first = Utc::now();
        store.mark_running(&j.id, first, 1).await.unwrap();

        // Redelivery after a nack: still Running, started_at unchanged.
        let later = first + chrono::Duration::seconds(30);
        let again = store.mark_running(&j.id, later, 2).await.unwrap();
        assert_eq!(again.started_at, Some(first));
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.get(&JobId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_pending_filters_by_status() {
        let store = MemoryJobStore::new();
        let pending = job();
        let done = job();
        store.insert(&pending).await.unwrap();
        store.insert(&done).await.unwrap();
        let now = Utc::now();
        store.mark_running(&done.id, now, 1).await.unwrap();
        store.mark_succeeded(&done.id, now).await.unwrap();

        let listed = store.list_pending().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, pending.id);
    }
}
