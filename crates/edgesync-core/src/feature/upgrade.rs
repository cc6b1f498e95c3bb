// ── Agent software upgrade ──

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ApplyOutcome, ApplyRequest, DevicePlanner, FeatureContext, FeatureModule, Outcome, Plan,
    request_data,
};
use crate::compat::messages;
use crate::error::CoreError;
use crate::model::{
    AgentVersion, Device, Feature, FeatureStatus, Job, JobOptions, JobPriority, Task,
};

#[derive(Debug, Deserialize)]
struct UpgradeRequest {
    version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpgradeJobData {
    request_time: DateTime<Utc>,
    version: String,
}

impl UpgradeJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        if device.upgrade.request_time != Some(self.request_time) {
            return false;
        }
        device.upgrade.status = outcome.status(true);
        if outcome == Outcome::Completed {
            device.versions.agent = Some(self.version.clone());
        }
        true
    }
}

struct UpgradePlanner {
    target: AgentVersion,
    version: String,
    options: JobOptions,
}

impl DevicePlanner for UpgradePlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        if device.agent_version() >= self.target
            || device.upgrade.status == FeatureStatus::Installing
        {
            return Ok(None);
        }
        device.upgrade.status = FeatureStatus::Installing;
        device.upgrade.target = Some(self.version.clone());
        device.upgrade.request_time = Some(now);

        Ok(Some(Plan {
            title: format!("Upgrade device to {}", self.version),
            tasks: vec![Task::agent(
                messages::UPGRADE_DEVICE_SW,
                json!({ "version": self.version }),
            )],
            data: json!(UpgradeJobData {
                request_time: now,
                version: self.version.clone(),
            }),
            options: Some(self.options),
        }))
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<UpgradeJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct UpgradeModule {
    ctx: Arc<FeatureContext>,
}

impl UpgradeModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<UpgradeJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for UpgradeModule {
    fn method(&self) -> Feature {
        Feature::Upgrade
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: UpgradeRequest = request_data(self.method(), &request.data)?;
        let planner = UpgradePlanner {
            target: body.version.parse()?,
            version: body.version,
            options: JobOptions {
                priority: JobPriority::High,
                ..self.ctx.config.job_options()
            },
        };
        self.ctx.submit(self.method(), request, &planner).await
    }

    async fn complete(&self, job: &Job, _result: &Value) {
        self.settle(job, Outcome::Completed).await;
    }

    async fn error(&self, job: &Job, _reason: &str) {
        self.settle(job, Outcome::Failed).await;
    }

    fn handles_remove(&self) -> bool {
        true
    }

    async fn remove(&self, job: &Job) {
        self.settle(job, Outcome::Removed).await;
    }
}
