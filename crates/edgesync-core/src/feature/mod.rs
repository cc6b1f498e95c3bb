// ── Feature modules ──
//
// Every feature (QoS, DHCP, VRRP, ...) implements `FeatureModule`: it
// turns an apply request into per-device jobs, settles its persisted
// state from job callbacks, and contributes its desired configuration to
// a full device sync.

pub(crate) mod app_identification;
mod dhcp;
mod firewall;
mod modify;
mod notifications;
mod qos_policy;
mod static_routes;
pub(crate) mod traffic_map;
mod upgrade;
mod vrrp;

pub use app_identification::AppIdentificationModule;
pub use dhcp::DhcpModule;
pub use firewall::FirewallModule;
pub use modify::ModifyModule;
pub use notifications::NotificationsModule;
pub use qos_policy::QosPolicyModule;
pub use static_routes::StaticRoutesModule;
pub use traffic_map::TrafficMapModule;
pub use upgrade::UpgradeModule;
pub use vrrp::VrrpModule;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::RequestClock;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::fanout::{DeviceFailure, fan_out};
use crate::model::{
    Device, DeviceId, Feature, FeatureStatus, Job, JobId, JobOptions, OrgId, PolicyId,
    ResponseMeta, Task,
};
use crate::queue::{JobQueue, JobRequest};
use crate::store::{Store, update_device};

// ── Contract ────────────────────────────────────────────────────────

/// `apply(devices, user, data)` as received by the dispatcher.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub devices: Vec<DeviceId>,
    pub user: String,
    pub data: Value,
}

/// What a module wants the device to hold after a full sync.
#[derive(Debug, Clone, Default)]
pub struct SyncContribution {
    /// Requests in send order, assuming the device starts empty.
    pub requests: Vec<Task>,
    /// Handed back to `complete_sync` once the device confirms.
    pub complete_data: Value,
    pub call_complete: bool,
}

impl SyncContribution {
    pub fn new(requests: Vec<Task>, complete_data: Value) -> Self {
        Self {
            requests,
            complete_data,
            call_complete: true,
        }
    }
}

#[async_trait]
pub trait FeatureModule: Send + Sync {
    fn method(&self) -> Feature;

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError>;

    /// The device confirmed the job.
    async fn complete(&self, job: &Job, result: &Value);

    /// The device or the queue reported failure.
    async fn error(&self, job: &Job, reason: &str);

    /// Whether `remove` should be routed to this module.
    fn handles_remove(&self) -> bool {
        false
    }

    /// The job was deleted before the device confirmed it.
    async fn remove(&self, _job: &Job) {}

    async fn sync(&self, _device: &Device) -> Result<SyncContribution, CoreError> {
        Ok(SyncContribution::default())
    }

    /// A sync carrying this module's contribution was confirmed.
    async fn complete_sync(&self, _device: &DeviceId, _data: &Value, _sync_time: DateTime<Utc>) {}
}

// ── ApplyOutcome ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyStatus {
    Completed,
    PartiallyCompleted,
    Failed,
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially completed",
            Self::Failed => "failed",
        })
    }
}

/// Result of one apply: the jobs queued, and what happened to the rest.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub ids: Vec<JobId>,
    pub status: ApplyStatus,
    pub message: String,
    pub failed: Vec<DeviceFailure>,
    /// Devices already at (or moving to) the requested state.
    pub skipped: Vec<DeviceId>,
}

impl ApplyOutcome {
    pub(crate) fn from_results(
        results: Vec<(DeviceId, Option<JobId>)>,
        failed: Vec<DeviceFailure>,
    ) -> Self {
        let mut ids = Vec::new();
        let mut skipped = Vec::new();
        for (device, job) in results {
            match job {
                Some(id) => ids.push(id),
                None => skipped.push(device),
            }
        }

        let total = ids.len() + skipped.len() + failed.len();
        let status = if failed.is_empty() {
            ApplyStatus::Completed
        } else if failed.len() == total {
            ApplyStatus::Failed
        } else {
            ApplyStatus::PartiallyCompleted
        };

        let mut message = format!("{} of {total} device(s) queued", ids.len());
        if !skipped.is_empty() {
            message.push_str(&format!(", {} already up to date", skipped.len()));
        }
        if !failed.is_empty() {
            let mut reasons: Vec<&str> = failed.iter().map(|f| f.reason.as_str()).collect();
            reasons.sort_unstable();
            reasons.dedup();
            message.push_str(&format!(", {} failed: {}", failed.len(), reasons.join("; ")));
        }

        Self {
            ids,
            status,
            message,
            failed,
            skipped,
        }
    }
}

// ── Job data and state settling ─────────────────────────────────────

/// One feature-state transition carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StateChange {
    pub feature: Feature,
    pub install: bool,
    pub request_time: DateTime<Utc>,
}

/// Job data of modules whose jobs only move singleton feature states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangeSet {
    pub request_time: DateTime<Utc>,
    pub changes: Vec<StateChange>,
}

/// Completion data of a singleton feature's sync contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Synced {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// Completion data of a multi-instance feature's sync contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EntriesSynced {
    #[serde(default)]
    pub installed: Vec<PolicyId>,
    #[serde(default)]
    pub removed: Vec<PolicyId>,
}

/// `action` field shared by install/uninstall style requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Action {
    Install,
    Uninstall,
}

/// Decode an apply payload; shape errors are the caller's fault.
pub(crate) fn request_data<T: DeserializeOwned>(method: Feature, data: &Value) -> Result<T, CoreError> {
    serde_json::from_value(data.clone())
        .map_err(|e| CoreError::validation(format!("invalid {method} request: {e}")))
}

/// How a job ended, from the feature's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    Removed,
    /// The queue refused the job.
    NotQueued,
}

impl Outcome {
    pub fn status(self, install: bool) -> FeatureStatus {
        match (self, install) {
            (Self::Completed, true) => FeatureStatus::Installed,
            (Self::Completed, false) => FeatureStatus::None,
            (Self::Failed, true) => FeatureStatus::InstallFailed,
            (Self::Failed, false) => FeatureStatus::UninstallFailed,
            (Self::Removed, _) => FeatureStatus::JobDeleted,
            (Self::NotQueued, _) => FeatureStatus::JobQueueFailed,
        }
    }
}

/// Apply `outcome` to the singleton state `change` targets, if no newer
/// request has been issued for it. Returns whether anything changed.
pub(crate) fn settle_change(device: &mut Device, change: &StateChange, outcome: Outcome) -> bool {
    let state = device.state_mut(change.feature);
    if !state.is_current(change.request_time) {
        return false;
    }
    state.status = outcome.status(change.install);
    if outcome == Outcome::Completed && !change.install {
        state.policy = None;
        state.revision = None;
    }
    true
}

/// Mark every change of a refused `ChangeSet` job as `job-queue-failed`.
pub(crate) fn revert_changes(device: &mut Device, data: &Value) {
    if let Ok(set) = serde_json::from_value::<ChangeSet>(data.clone()) {
        for change in &set.changes {
            settle_change(device, change, Outcome::NotQueued);
        }
    }
}

/// Record that a full sync delivered a singleton feature's desired state.
pub(crate) fn settle_synced(
    device: &mut Device,
    feature: Feature,
    installed: bool,
    revision: Option<u64>,
    sync_time: DateTime<Utc>,
) -> bool {
    let state = device.state_mut(feature);
    if !state.not_newer_than(sync_time) {
        return false;
    }
    if installed {
        state.status = FeatureStatus::Installed;
        if revision.is_some() {
            state.revision = revision;
        }
    } else {
        state.status = FeatureStatus::None;
        state.policy = None;
        state.revision = None;
    }
    true
}

/// Wrap a multi-task plan so the device applies it atomically.
pub(crate) fn job_tasks(tasks: Vec<Task>) -> Vec<Task> {
    if tasks.len() > 1 {
        vec![Task::aggregated(tasks)]
    } else {
        tasks
    }
}

// ── Planning ────────────────────────────────────────────────────────

/// One device's share of an apply.
pub(crate) struct Plan {
    pub title: String,
    pub tasks: Vec<Task>,
    /// Stored in the job's response metadata.
    pub data: Value,
    pub options: Option<JobOptions>,
}

/// Per-device decision logic shared by the submission path.
///
/// `plan` records the pending transition on the device and returns the
/// job to send, or `None` when the device already is (or is moving to)
/// the requested state. A plan without tasks persists the device but
/// queues nothing. It runs once as a dry run for validation and again
/// inside the optimistic write.
pub(crate) trait DevicePlanner: Send + Sync {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError>;

    /// Undo the pending state after the queue refused the job.
    fn revert(&self, device: &mut Device, data: &Value);
}

// ── FeatureContext ──────────────────────────────────────────────────

/// Collaborators shared by all modules.
pub struct FeatureContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<RequestClock>,
    pub config: EngineConfig,
}

impl FeatureContext {
    pub fn new(config: EngineConfig, store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            clock: Arc::new(RequestClock::new()),
            config,
        }
    }

    pub(crate) async fn load_device(&self, id: &DeviceId) -> Result<Device, CoreError> {
        self.store
            .device(id)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound {
                device: id.to_string(),
            })
    }

    pub(crate) async fn update<T, F>(
        &self,
        id: &DeviceId,
        mutate: F,
    ) -> Result<Option<(Device, T)>, CoreError>
    where
        F: FnMut(&mut Device) -> Result<Option<T>, CoreError> + Send,
        T: Send,
    {
        update_device(self.store.as_ref(), id, self.config.store_retry_limit, mutate).await
    }

    /// Decode a job's response metadata. Malformed data is logged and
    /// the callback dropped.
    pub(crate) fn job_data<T: DeserializeOwned>(&self, method: Feature, job: &Job) -> Option<T> {
        match serde_json::from_value(job.meta.data.clone()) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(job = %job.id, device = %job.device, method = %method, error = %e, "unreadable job data");
                None
            }
        }
    }

    /// Apply a callback's state change to the job's device. Errors are
    /// logged, never returned: callbacks run outside any caller.
    pub(crate) async fn settle<F>(&self, method: Feature, job: &Job, what: &str, mutate: F)
    where
        F: FnMut(&mut Device) -> bool + Send,
    {
        self.settle_device(method, &job.device, Some(job.id), what, mutate)
            .await;
    }

    pub(crate) async fn settle_device<F>(
        &self,
        method: Feature,
        device: &DeviceId,
        job: Option<JobId>,
        what: &str,
        mut mutate: F,
    ) where
        F: FnMut(&mut Device) -> bool + Send,
    {
        let job = job.map(JobId::get);
        match self.update(device, |dev| Ok(mutate(dev).then_some(()))).await {
            Ok(Some(_)) => debug!(job, device = %device, method = %method, "{what} recorded"),
            Ok(None) => debug!(job, device = %device, method = %method, "stale {what} ignored"),
            Err(e) => warn!(job, device = %device, method = %method, error = %e, "failed to record {what}"),
        }
    }

    /// Mark a singleton feature as delivered by a confirmed sync.
    pub(crate) async fn settle_synced_singleton(
        &self,
        feature: Feature,
        device: &DeviceId,
        data: &Value,
        sync_time: DateTime<Utc>,
    ) {
        let synced: Synced = match serde_json::from_value(data.clone()) {
            Ok(synced) => synced,
            Err(e) => {
                warn!(device = %device, method = %feature, error = %e, "unreadable sync data");
                return;
            }
        };
        self.settle_device(feature, device, None, "sync confirmation", |dev| {
            settle_synced(dev, feature, synced.installed, synced.revision, sync_time)
        })
        .await;
    }

    /// Organizations owning `devices`, for loading org-wide documents.
    pub(crate) async fn orgs_of(&self, devices: &[DeviceId]) -> Result<BTreeSet<OrgId>, CoreError> {
        let mut orgs = BTreeSet::new();
        for id in devices {
            orgs.insert(self.load_device(id).await?.org);
        }
        Ok(orgs)
    }

    /// Settle every `StateChange` a `ChangeSet` job carries.
    pub(crate) async fn settle_changes(&self, method: Feature, job: &Job, outcome: Outcome) {
        let Some(data) = self.job_data::<ChangeSet>(method, job) else {
            return;
        };
        self.settle(method, job, "job outcome", |dev| {
            data.changes
                .iter()
                .fold(false, |any, change| settle_change(dev, change, outcome) | any)
        })
        .await;
    }

    /// Validate on every device, then persist and enqueue per device with
    /// bounded concurrency. Validation errors abort before anything is
    /// written; per-device persistence or queue errors are collected.
    pub(crate) async fn submit(
        &self,
        method: Feature,
        request: &ApplyRequest,
        planner: &dyn DevicePlanner,
    ) -> Result<ApplyOutcome, CoreError> {
        let devices = dedup(&request.devices);
        if devices.is_empty() {
            return Err(CoreError::validation("no devices given"));
        }

        for id in &devices {
            let mut device = self.load_device(id).await?;
            if !device.approved {
                return Err(CoreError::validation(format!("device {id} is not approved")));
            }
            planner.plan(&mut device, self.clock.now())?;
        }

        let result = fan_out(devices, self.config.fanout_concurrency, |id| {
            self.submit_one(method, &request.user, id, planner)
        })
        .await;
        let outcome = ApplyOutcome::from_results(result.succeeded, result.failed);
        info!(method = %method, status = %outcome.status, jobs = outcome.ids.len(), "{}", outcome.message);
        Ok(outcome)
    }

    async fn submit_one(
        &self,
        method: Feature,
        user: &str,
        id: DeviceId,
        planner: &dyn DevicePlanner,
    ) -> Result<Option<JobId>, CoreError> {
        let Some((device, plan)) = self
            .update(&id, |dev| planner.plan(dev, self.clock.now()))
            .await?
        else {
            debug!(device = %id, method = %method, "already in requested state");
            return Ok(None);
        };
        if plan.tasks.is_empty() {
            debug!(device = %id, method = %method, "device updated, nothing to send");
            return Ok(None);
        }

        let request = JobRequest {
            device: id.clone(),
            user: user.to_owned(),
            org: device.org.clone(),
            title: plan.title,
            tasks: job_tasks(plan.tasks),
            meta: ResponseMeta {
                method: method.to_string(),
                data: plan.data.clone(),
            },
            options: plan.options.unwrap_or_else(|| self.config.job_options()),
            complete_override: None,
        };

        match self.queue.enqueue(request).await {
            Ok(job) => {
                debug!(job = %job.id, device = %id, method = %method, "job queued");
                Ok(Some(job.id))
            }
            Err(e) => {
                warn!(device = %id, method = %method, error = %e, "enqueue failed, reverting device state");
                let reverted = self
                    .update(&id, |dev| {
                        planner.revert(dev, &plan.data);
                        Ok(Some(()))
                    })
                    .await;
                if let Err(revert_err) = reverted {
                    warn!(device = %id, method = %method, error = %revert_err, "failed to revert device state");
                }
                Err(e.into())
            }
        }
    }
}

fn dedup(devices: &[DeviceId]) -> Vec<DeviceId> {
    let mut seen = HashSet::new();
    devices
        .iter()
        .filter(|d| seen.insert((*d).clone()))
        .cloned()
        .collect()
}

/// Every feature module, wired to one context.
pub fn default_modules(ctx: &Arc<FeatureContext>) -> Vec<Arc<dyn FeatureModule>> {
    vec![
        Arc::new(NotificationsModule::new(Arc::clone(ctx))),
        Arc::new(AppIdentificationModule::new(Arc::clone(ctx))),
        Arc::new(ModifyModule::new(Arc::clone(ctx))),
        Arc::new(StaticRoutesModule::new(Arc::clone(ctx))),
        Arc::new(DhcpModule::new(Arc::clone(ctx))),
        Arc::new(VrrpModule::new(Arc::clone(ctx))),
        Arc::new(TrafficMapModule::new(Arc::clone(ctx))),
        Arc::new(QosPolicyModule::new(Arc::clone(ctx))),
        Arc::new(FirewallModule::new(Arc::clone(ctx))),
        Arc::new(UpgradeModule::new(Arc::clone(ctx))),
    ]
}
