//! Redis-backed job store.
//!
//! One JSON record per job under `{prefix}:job:{id}`, plus a set of
//! pending ids under `{prefix}:pending` for startup recovery. Terminal
//! records carry a TTL: the registry serves in-flight status queries, not
//! long-term job history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::debug;

use encq_models::{Job, JobId, JobStatus};

use crate::error::{RegistryError, RegistryResult};
use crate::store::{apply_transition, JobStore};

/// Redis registry configuration.
#[derive(Debug, Clone)]
pub struct RedisRegistryConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for all registry keys
    pub key_prefix: String,
    /// TTL applied to terminal (Succeeded/Failed) records, in seconds
    pub terminal_ttl_secs: i64,
}

impl Default for RedisRegistryConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "encq".to_string(),
            terminal_ttl_secs: 86_400, // 24 hours
        }
    }
}

impl RedisRegistryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("REGISTRY_KEY_PREFIX")
                .unwrap_or_else(|_| "encq".to_string()),
            terminal_ttl_secs: std::env::var("REGISTRY_TERMINAL_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(86_400),
        }
    }
}

/// Durable job store on Redis. Registry entries survive dispatcher and
/// worker restarts.
pub struct RedisJobStore {
    client: redis::Client,
    config: RedisRegistryConfig,
}

impl RedisJobStore {
    /// Create a new store.
    pub fn new(config: RedisRegistryConfig) -> RegistryResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> RegistryResult<Self> {
        Self::new(RedisRegistryConfig::from_env())
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.config.key_prefix)
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.config.key_prefix)
    }

    async fn conn(&self) -> RegistryResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn write_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
    ) -> RegistryResult<()> {
        let key = self.job_key(&job.id);
        let payload = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(&key, payload).await?;

        // One index set per recoverable status, so startup recovery can
        // find both never-started and mid-delivery jobs.
        match job.status {
            JobStatus::Pending => {
                conn.sadd::<_, _, ()>(self.pending_key(), job.id.as_str())
                    .await?;
                conn.srem::<_, _, ()>(self.running_key(), job.id.as_str())
                    .await?;
            }
            JobStatus::Running => {
                conn.sadd::<_, _, ()>(self.running_key(), job.id.as_str())
                    .await?;
                conn.srem::<_, _, ()>(self.pending_key(), job.id.as_str())
                    .await?;
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                conn.srem::<_, _, ()>(self.pending_key(), job.id.as_str())
                    .await?;
                conn.srem::<_, _, ()>(self.running_key(), job.id.as_str())
                    .await?;
            }
        }

        if job.status.is_terminal() {
            conn.expire::<_, ()>(&key, self.config.terminal_ttl_secs)
                .await?;
        }
        Ok(())
    }

    async fn read_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
    ) -> RegistryResult<Job> {
        let payload: Option<String> = conn.get(self.job_key(id)).await?;
        let payload = payload.ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn update(
        &self,
        id: &JobId,
        to: JobStatus,
        at: DateTime<Utc>,
        detail: Option<&str>,
        attempt: Option<u32>,
    ) -> RegistryResult<Job> {
        let mut conn = self.conn().await?;
        let current = self.read_job(&mut conn, id).await?;
        let updated = apply_transition(current, to, at, detail, attempt)?;
        self.write_job(&mut conn, &updated).await?;
        debug!(job_id = %id, status = %to, "Updated job record");
        Ok(updated)
    }

    async fn list_from_index(
        &self,
        set_key: String,
        status: JobStatus,
    ) -> RegistryResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(&set_key).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let id = JobId::from_string(id);
            match self.read_job(&mut conn, &id).await {
                Ok(job) if job.status == status => jobs.push(job),
                // Record expired or moved on; drop the stale set member.
                Ok(_) | Err(RegistryError::NotFound(_)) => {
                    conn.srem::<_, _, ()>(&set_key, id.as_str()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &Job) -> RegistryResult<()> {
        let mut conn = self.conn().await?;
        self.write_job(&mut conn, job).await?;
        debug!(job_id = %job.id, "Inserted job record");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> RegistryResult<Job> {
        let mut conn = self.conn().await?;
        self.read_job(&mut conn, id).await
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
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.job_key(id)).await?;
        conn.srem::<_, _, ()>(self.pending_key(), id.as_str())
            .await?;
        conn.srem::<_, _, ()>(self.running_key(), id.as_str())
            .await?;
        Ok(())
    }

    async fn list_pending(&self) -> RegistryResult<Vec<Job>> {
        self.list_from_index(self.pending_key(), JobStatus::Pending)
            .await
    }

    async fn list_running(&self) -> RegistryResult<Vec<Job>> {
        self.list_from_index(self.running_key(), JobStatus::Running)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encq_models::{EncodeParams, JobKind, RoutingKey};

    fn job() -> Job {
        Job::new(
            JobKind::Video,
            format!("input/{}_clip.mkv", uuid_suffix()),
            EncodeParams::default_for(JobKind::Video),
            5,
            RoutingKey::All,
        )
    }

    fn uuid_suffix() -> String {
        JobId::new().to_string()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn redis_roundtrip() {
        dotenvy::dotenv().ok();
        let store = RedisJobStore::from_env().expect("store");
        let j = job();
        store.insert(&j).await.expect("insert");

        let fetched = store.get(&j.id).await.expect("get");
        assert_eq!(fetched.id, j.id);
        assert_eq!(fetched.status, JobStatus::Pending);

        let now = Utc::now();
        store.mark_running(&j.id, now, 1).await.expect("running");
        store.mark_succeeded(&j.id, now).await.expect("succeeded");
        let done = store.get(&j.id).await.expect("get terminal");
        assert!(done.status.is_terminal());

        store.remove(&j.id).await.expect("remove");
        assert!(store.get(&j.id).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn redis_pending_listing() {
        dotenvy::dotenv().ok();
        let store = RedisJobStore::from_env().expect("store");
        let j = job();
        store.insert(&j).await.expect("insert");

        let pending = store.list_pending().await.expect("list");
        assert!(pending.iter().any(|p| p.id == j.id));

        store.remove(&j.id).await.expect("remove");
    }
}
