// ── In-memory job queue ──
//
// Reference queue with an explicit state machine. Tests and the CLI
// drive device outcomes through `complete`, `fail` and `remove`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::{JobEvent, JobQueue, JobRequest, QueueError};
use crate::model::{DeviceId, Job, JobId, JobState};

/// Serializable queue contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub next_id: u64,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub remove_methods: Vec<String>,
}

pub struct MemoryJobQueue {
    jobs: DashMap<JobId, Job>,
    next_id: AtomicU64,
    remove_methods: DashSet<String>,
    rejected: DashSet<DeviceId>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
            remove_methods: DashSet::new(),
            rejected: DashSet::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let queue = Self::new();
        queue.next_id.store(snapshot.next_id.max(1), Ordering::Release);
        for job in snapshot.jobs {
            queue.jobs.insert(job.id, job);
        }
        for method in snapshot.remove_methods {
            queue.remove_methods.insert(method);
        }
        queue
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|r| r.value().clone()).collect();
        jobs.sort_by_key(|j| j.id);
        let mut remove_methods: Vec<String> =
            self.remove_methods.iter().map(|m| m.key().clone()).collect();
        remove_methods.sort();
        QueueSnapshot {
            next_id: self.next_id.load(Ordering::Acquire),
            jobs,
            remove_methods,
        }
    }

    // ── Fault injection ──────────────────────────────────────────────

    /// Make every enqueue for `device` fail until cleared.
    pub fn reject_device(&self, device: impl Into<DeviceId>) {
        self.rejected.insert(device.into());
    }

    pub fn accept_device(&self, device: &DeviceId) {
        self.rejected.remove(device);
    }

    // ── State machine ────────────────────────────────────────────────

    fn emit(&self, event: JobEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events_tx.send(event) {
            let job = event.job();
            warn!(
                job = %job.id,
                device = %job.device,
                method = %job.meta.method,
                "job event dropped, no subscriber"
            );
        }
    }

    fn transition(
        &self,
        id: JobId,
        action: &'static str,
        allowed: impl Fn(JobState) -> bool,
        next: JobState,
    ) -> Result<Job, QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !allowed(job.state) {
            return Err(QueueError::InvalidState {
                job: id,
                state: job.state,
                action,
            });
        }
        job.state = next;
        Ok(job.clone())
    }

    pub fn activate(&self, id: JobId) -> Result<Job, QueueError> {
        self.transition(
            id,
            "activate",
            |s| matches!(s, JobState::Inactive | JobState::Delayed),
            JobState::Active,
        )
    }

    pub fn delay(&self, id: JobId) -> Result<Job, QueueError> {
        self.transition(id, "delay", |s| s == JobState::Inactive, JobState::Delayed)
    }

    /// Device reported success.
    pub fn complete(&self, id: JobId, result: Value) -> Result<Job, QueueError> {
        let mut job = self.transition(id, "complete", JobState::is_pending, JobState::Complete)?;
        job.result = Some(result.clone());
        if job.options.remove_on_complete {
            self.jobs.remove(&id);
        } else {
            self.jobs.insert(id, job.clone());
        }
        debug!(job = %id, device = %job.device, "job completed");
        self.emit(JobEvent::Completed {
            job: job.clone(),
            result,
        });
        Ok(job)
    }

    /// Device reported failure.
    pub fn fail(&self, id: JobId, reason: &str) -> Result<Job, QueueError> {
        let mut job = self.transition(id, "fail", JobState::is_pending, JobState::Failed)?;
        job.error = Some(reason.to_owned());
        self.jobs.insert(id, job.clone());
        debug!(job = %id, device = %job.device, reason, "job failed");
        self.emit(JobEvent::Failed {
            job: job.clone(),
            reason: reason.to_owned(),
        });
        Ok(job)
    }

    /// Delete a job. Pending jobs of registered methods raise `Removed`;
    /// finished jobs are purged silently.
    pub fn remove(&self, id: JobId) -> Result<Job, QueueError> {
        let (_, mut job) = self.jobs.remove(&id).ok_or(QueueError::NotFound(id))?;
        if job.state.is_pending() {
            job.state = JobState::Removed;
            if self.remove_methods.contains(&job.meta.method) {
                self.emit(JobEvent::Removed { job: job.clone() });
            } else {
                debug!(job = %id, method = %job.meta.method, "no remove handler registered");
            }
        }
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: JobRequest) -> Result<Job, QueueError> {
        if self.rejected.contains(&request.device) {
            return Err(QueueError::Rejected {
                device: request.device,
                reason: "queue unavailable for device".into(),
            });
        }

        let id = JobId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let job = Job {
            id,
            device: request.device,
            org: request.org,
            user: request.user,
            title: request.title,
            tasks: request.tasks,
            meta: request.meta,
            options: request.options,
            complete_override: request.complete_override,
            state: JobState::Inactive,
            created_at: Utc::now(),
            result: None,
            error: None,
        };
        self.jobs.insert(id, job.clone());
        debug!(job = %id, device = %job.device, method = %job.meta.method, "job enqueued");
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.get(&id).map(|r| r.value().clone()))
    }

    async fn jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.snapshot().jobs)
    }

    fn register_remove_method(&self, method: &str) {
        self.remove_methods.insert(method.to_owned());
    }

    async fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events_rx.lock().await.take()
    }
}
