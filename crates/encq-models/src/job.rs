//! Job record and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::locator::derive_output_locator;
use crate::params::EncodeParams;
use crate::routing::RoutingKey;

/// Unique identifier for a job, assigned at submission, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which encoder invocation path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// PNG source, lossless WebP target.
    Image,
    /// Video source, SVT-AV1 re-encode with stream copy for everything else.
    Video,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Video => "video",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job state. Transitions are monotonic: a status never regresses and a
/// terminal status is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a queue.
    #[default]
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed permanently (validation never reaches this; retry budget did).
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                // A job that never started can still fail permanently
                // (enqueue rollback, retry exhaustion while requeued).
                | (JobStatus::Pending, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A media-encoding job as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job kind
    pub kind: JobKind,

    /// Blob-store key of the source object
    pub input_locator: String,

    /// Blob-store key the encoded result is written to; derived
    /// deterministically from the input locator and kind
    pub output_locator: String,

    /// Kind-specific encoding parameters
    pub params: EncodeParams,

    /// Priority 0-10, higher served first within a routing key
    pub priority: u8,

    /// Queue the job is visible to
    #[serde(default)]
    pub routing_key: RoutingKey,

    /// Current status
    #[serde(default)]
    pub status: JobStatus,

    /// Delivery attempts consumed so far
    #[serde(default)]
    pub retry_count: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Set exactly once, when a worker claims the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set exactly once, when the job reaches a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Present only when status is Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Job {
    /// Create a new Pending job. The output locator is derived from the
    /// input locator and kind.
    pub fn new(
        kind: JobKind,
        input_locator: impl Into<String>,
        params: EncodeParams,
        priority: u8,
        routing_key: RoutingKey,
    ) -> Self {
        let input_locator = input_locator.into();
        let output_locator = derive_output_locator(&input_locator, kind);

        Self {
            id: JobId::new(),
            kind,
            input_locator,
            output_locator,
            params,
            priority,
            routing_key,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_detail: None,
        }
    }

    /// Mark the job Running.
    pub fn start(mut self, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
        self
    }

    /// Mark the job Succeeded.
    pub fn succeed(mut self, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Succeeded;
        self.completed_at = Some(at);
        self
    }

    /// Mark the job Failed with a human-readable error detail.
    pub fn fail(mut self, at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        self.status = JobStatus::Failed;
        self.completed_at = Some(at);
        self.error_detail = Some(detail.into());
        self
    }
}
