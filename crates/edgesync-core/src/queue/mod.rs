// ── Job queue boundary ──
//
// The queue owns job storage, retries and priorities. The engine only
// enqueues and consumes the typed event stream.

mod memory;

pub use memory::{MemoryJobQueue, QueueSnapshot};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{DeviceId, Job, JobId, JobOptions, JobState, OrgId, ResponseMeta, Task};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue rejected job for device {device}: {reason}")]
    Rejected { device: DeviceId, reason: String },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {job} is {state}, cannot {action}")]
    InvalidState {
        job: JobId,
        state: JobState,
        action: &'static str,
    },

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Everything needed to create one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub device: DeviceId,
    pub user: String,
    pub org: OrgId,
    pub title: String,
    pub tasks: Vec<Task>,
    pub meta: ResponseMeta,
    pub options: JobOptions,
    /// Route the completion callback to this method instead of `meta.method`.
    pub complete_override: Option<String>,
}

/// Job lifecycle notifications consumed by the dispatcher loop.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed { job: Job, result: Value },
    Failed { job: Job, reason: String },
    /// Deleted or expired before the device confirmed it.
    Removed { job: Job },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            Self::Completed { job, .. } | Self::Failed { job, .. } | Self::Removed { job } => job,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: JobRequest) -> Result<Job, QueueError>;

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn jobs(&self) -> Result<Vec<Job>, QueueError>;

    /// Route deletions of jobs tagged with `method` to the event stream.
    fn register_remove_method(&self, method: &str);

    /// Take the event receiver. Only the first caller gets it.
    async fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<JobEvent>>;
}
