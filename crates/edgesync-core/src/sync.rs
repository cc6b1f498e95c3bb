// ── Sync orchestrator ──
//
// Rebuilds a device's full configuration from every module's desired
// state and sends it as one aggregated job. The ordered request list is
// fingerprinted so an unchanged device is never re-sent, and a device
// that reports the same fingerprint on connect needs no sync at all.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::fanout::fan_out;
use crate::feature::{ApplyOutcome, ApplyRequest, FeatureContext, FeatureModule};
use crate::model::{
    Device, DeviceId, DeviceVersions, Feature, Job, JobId, ResponseMeta, SyncStatus, Task,
};
use crate::queue::JobRequest;

/// Order in which module contributions are concatenated.
pub const SYNC_ORDER: [Feature; 9] = [
    Feature::Notifications,
    Feature::AppIdentification,
    Feature::Modify,
    Feature::StaticRoutes,
    Feature::Dhcp,
    Feature::Vrrp,
    Feature::QosTrafficMap,
    Feature::QosPolicy,
    Feature::FirewallPolicy,
];

/// SHA-256 over the serialized request list, hex encoded.
pub fn fingerprint(requests: &[Task]) -> Result<String, CoreError> {
    let bytes = serde_json::to_vec(requests)
        .map_err(|e| CoreError::Internal(format!("serialize sync requests: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModuleData {
    method: Feature,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncJobData {
    request_time: DateTime<Utc>,
    hash: String,
    modules: Vec<ModuleData>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    force: bool,
}

/// A device's desired configuration as one request list.
struct DesiredState {
    requests: Vec<Task>,
    modules: Vec<ModuleData>,
    hash: String,
}

enum Step {
    Unchanged,
    Confirmed,
    Send(DateTime<Utc>),
}

pub struct SyncOrchestrator {
    ctx: Arc<FeatureContext>,
    modules: Vec<Arc<dyn FeatureModule>>,
}

impl SyncOrchestrator {
    /// Keeps the modules named in `SYNC_ORDER`, in that order.
    pub fn new(ctx: Arc<FeatureContext>, modules: &[Arc<dyn FeatureModule>]) -> Self {
        let modules = SYNC_ORDER
            .iter()
            .filter_map(|feature| modules.iter().find(|m| m.method() == *feature).cloned())
            .collect();
        Self { ctx, modules }
    }

    async fn desired(&self, device: &Device) -> Result<DesiredState, CoreError> {
        let mut requests = Vec::new();
        let mut modules = Vec::new();
        for module in &self.modules {
            let contribution = module.sync(device).await?;
            requests.extend(contribution.requests);
            if contribution.call_complete {
                modules.push(ModuleData {
                    method: module.method(),
                    data: contribution.complete_data,
                });
            }
        }
        let hash = fingerprint(&requests)?;
        Ok(DesiredState {
            requests,
            modules,
            hash,
        })
    }

    async fn confirm_modules(&self, device: &DeviceId, modules: &[ModuleData], at: DateTime<Utc>) {
        for entry in modules {
            match self.modules.iter().find(|m| m.method() == entry.method) {
                Some(module) => module.complete_sync(device, &entry.data, at).await,
                None => warn!(device = %device, method = %entry.method, "sync data for unknown module"),
            }
        }
    }

    /// Send the device its full desired configuration.
    ///
    /// Without `force`, a device whose desired state hashes to what was
    /// last requested, in flight, or confirmed is left alone. Returns the
    /// queued job, if any.
    pub async fn request_sync(&self, id: &DeviceId, force: bool) -> Result<Option<JobId>, CoreError> {
        let device = self.ctx.load_device(id).await?;
        let desired = self.desired(&device).await?;

        let step = self
            .ctx
            .update(id, |dev| {
                let settled = matches!(
                    dev.sync.status,
                    SyncStatus::SyncRequested | SyncStatus::SyncInFlight | SyncStatus::SyncConfirmed
                );
                if !force && settled && dev.sync.hash.as_deref() == Some(desired.hash.as_str()) {
                    return Ok(None);
                }
                let now = self.ctx.clock.now();
                dev.sync.hash = Some(desired.hash.clone());
                dev.sync.request_time = Some(now);
                dev.sync.job = None;
                if desired.requests.is_empty() {
                    dev.sync.status = SyncStatus::SyncConfirmed;
                    Ok(Some(Step::Confirmed))
                } else {
                    dev.sync.status = SyncStatus::SyncRequested;
                    Ok(Some(Step::Send(now)))
                }
            })
            .await?
            .map_or(Step::Unchanged, |(_, step)| step);

        let request_time = match step {
            Step::Unchanged => {
                debug!(device = %id, "desired state unchanged, no sync needed");
                return Ok(None);
            }
            Step::Confirmed => {
                debug!(device = %id, "nothing to sync");
                return Ok(None);
            }
            Step::Send(at) => at,
        };

        let request = JobRequest {
            device: id.clone(),
            user: "system".into(),
            org: device.org.clone(),
            title: "Sync device".into(),
            tasks: vec![Task::aggregated(desired.requests)],
            meta: ResponseMeta {
                method: Feature::Sync.to_string(),
                data: json!(SyncJobData {
                    request_time,
                    hash: desired.hash,
                    modules: desired.modules,
                }),
            },
            options: self.ctx.config.job_options(),
            complete_override: None,
        };

        match self.ctx.queue.enqueue(request).await {
            Ok(job) => {
                self.ctx
                    .settle_device(Feature::Sync, id, Some(job.id), "sync enqueue", |dev| {
                        if dev.sync.request_time != Some(request_time) {
                            return false;
                        }
                        dev.sync.status = SyncStatus::SyncInFlight;
                        dev.sync.job = Some(job.id);
                        true
                    })
                    .await;
                info!(device = %id, job = %job.id, "sync queued");
                Ok(Some(job.id))
            }
            Err(e) => {
                warn!(device = %id, error = %e, "sync enqueue failed");
                self.ctx
                    .settle_device(Feature::Sync, id, None, "sync failure", |dev| {
                        mark_failed(dev, request_time)
                    })
                    .await;
                Err(e.into())
            }
        }
    }

    /// A device (re)connected and reported its versions and the
    /// fingerprint of the configuration it holds.
    pub async fn on_device_connected(
        &self,
        id: &DeviceId,
        versions: DeviceVersions,
        reported_hash: Option<&str>,
    ) -> Result<Option<JobId>, CoreError> {
        let updated = self
            .ctx
            .update(id, |dev| {
                if dev.versions == versions {
                    return Ok(None);
                }
                dev.versions = versions.clone();
                Ok(Some(()))
            })
            .await?;
        if updated.is_some() {
            debug!(device = %id, agent = ?versions.agent, "device versions updated");
        }

        let device = self.ctx.load_device(id).await?;
        let desired = self.desired(&device).await?;
        if reported_hash != Some(desired.hash.as_str()) {
            return self.request_sync(id, true).await;
        }

        let now = self.ctx.clock.now();
        self.ctx
            .settle_device(Feature::Sync, id, None, "sync confirmation", |dev| {
                dev.sync.status = SyncStatus::SyncConfirmed;
                dev.sync.hash = Some(desired.hash.clone());
                dev.sync.request_time = Some(now);
                dev.sync.job = None;
                true
            })
            .await;
        self.confirm_modules(id, &desired.modules, now).await;
        info!(device = %id, "device already in sync");
        Ok(None)
    }

    async fn mark_job_failed(&self, job: &Job) {
        let Some(data) = self.ctx.job_data::<SyncJobData>(Feature::Sync, job) else {
            return;
        };
        self.ctx
            .settle(Feature::Sync, job, "sync failure", |dev| {
                mark_failed(dev, data.request_time)
            })
            .await;
    }
}

fn mark_failed(device: &mut Device, request_time: DateTime<Utc>) -> bool {
    if device.sync.request_time != Some(request_time) {
        return false;
    }
    device.sync.status = SyncStatus::SyncFailed;
    device.sync.job = None;
    true
}

#[async_trait]
impl FeatureModule for SyncOrchestrator {
    fn method(&self) -> Feature {
        Feature::Sync
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: SyncRequest = if request.data.is_null() {
            SyncRequest::default()
        } else {
            serde_json::from_value(request.data.clone())
                .map_err(|e| CoreError::validation(format!("invalid sync request: {e}")))?
        };
        let mut devices = request.devices.clone();
        devices.sort();
        devices.dedup();
        if devices.is_empty() {
            return Err(CoreError::validation("no devices given"));
        }
        for id in &devices {
            self.ctx.load_device(id).await?;
        }

        let force = body.force;
        let result = fan_out(devices, self.ctx.config.fanout_concurrency, |id| async move {
            self.request_sync(&id, force).await
        })
        .await;
        let outcome = ApplyOutcome::from_results(result.succeeded, result.failed);
        info!(method = "sync", status = %outcome.status, jobs = outcome.ids.len(), "{}", outcome.message);
        Ok(outcome)
    }

    async fn complete(&self, job: &Job, _result: &Value) {
        let Some(data) = self.ctx.job_data::<SyncJobData>(Feature::Sync, job) else {
            return;
        };
        let mut current = false;
        self.ctx
            .settle(Feature::Sync, job, "sync completion", |dev| {
                current = dev.sync.request_time == Some(data.request_time);
                if current {
                    dev.sync.status = SyncStatus::SyncConfirmed;
                    dev.sync.job = None;
                }
                current
            })
            .await;
        if current {
            self.confirm_modules(&job.device, &data.modules, data.request_time)
                .await;
        }
    }

    async fn error(&self, job: &Job, reason: &str) {
        debug!(job = %job.id, device = %job.device, reason, "sync job failed");
        self.mark_job_failed(job).await;
    }

    fn handles_remove(&self) -> bool {
        true
    }

    async fn remove(&self, job: &Job) {
        self.mark_job_failed(job).await;
    }
}
