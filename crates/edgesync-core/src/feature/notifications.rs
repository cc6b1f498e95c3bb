// ── Notifications ──
//
// Pushes the org's alert thresholds to devices that can evaluate them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    Action, ApplyOutcome, ApplyRequest, ChangeSet, DevicePlanner, FeatureContext, FeatureModule,
    Outcome, Plan, StateChange, SyncContribution, Synced, request_data, revert_changes,
};
use crate::compat::{self, messages, transform_notifications};
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, Feature, FeatureStatus, Job, NotificationsConfig, OrgId, Task,
};

#[derive(Debug, Deserialize)]
struct NotificationsRequest {
    action: Action,
}

struct NotificationsPlanner {
    action: Action,
    configs: BTreeMap<OrgId, NotificationsConfig>,
}

impl DevicePlanner for NotificationsPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let version = device.agent_version();
        let (title, task, install) = match self.action {
            Action::Install => {
                compat::require(Feature::Notifications, device)?;
                let config = self
                    .configs
                    .get(&device.org)
                    .ok_or_else(|| CoreError::policy_not_found("Notifications", &device.org))?;
                let state = device.state_mut(Feature::Notifications);
                if state.targets(None, Some(config.revision)) {
                    return Ok(None);
                }
                state.begin(FeatureStatus::Installing, now);
                state.revision = Some(config.revision);
                (
                    "Install notifications",
                    Task::agent(
                        messages::ADD_NOTIFICATIONS,
                        transform_notifications(config, &version),
                    ),
                    true,
                )
            }
            Action::Uninstall => {
                let state = device.state_mut(Feature::Notifications);
                if matches!(
                    state.status,
                    FeatureStatus::None | FeatureStatus::Uninstalling
                ) {
                    return Ok(None);
                }
                state.begin(FeatureStatus::Uninstalling, now);
                (
                    "Uninstall notifications",
                    Task::agent(messages::REMOVE_NOTIFICATIONS, json!({})),
                    false,
                )
            }
        };

        Ok(Some(Plan {
            title: title.into(),
            tasks: vec![task],
            data: json!(ChangeSet {
                request_time: now,
                changes: vec![StateChange {
                    feature: Feature::Notifications,
                    install,
                    request_time: now,
                }],
            }),
            options: None,
        }))
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        revert_changes(device, data);
    }
}

pub struct NotificationsModule {
    ctx: Arc<FeatureContext>,
}

impl NotificationsModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FeatureModule for NotificationsModule {
    fn method(&self) -> Feature {
        Feature::Notifications
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: NotificationsRequest = request_data(self.method(), &request.data)?;
        let mut configs = BTreeMap::new();
        if body.action == Action::Install {
            for org in self.ctx.orgs_of(&request.devices).await? {
                if let Some(config) = self.ctx.store.notifications(&org).await? {
                    configs.insert(org, config);
                }
            }
        }
        let planner = NotificationsPlanner {
            action: body.action,
            configs,
        };
        self.ctx.submit(self.method(), request, &planner).await
    }

    async fn complete(&self, job: &Job, _result: &Value) {
        self.ctx
            .settle_changes(self.method(), job, Outcome::Completed)
            .await;
    }

    async fn error(&self, job: &Job, _reason: &str) {
        self.ctx
            .settle_changes(self.method(), job, Outcome::Failed)
            .await;
    }

    fn handles_remove(&self) -> bool {
        true
    }

    async fn remove(&self, job: &Job) {
        self.ctx
            .settle_changes(self.method(), job, Outcome::Removed)
            .await;
    }

    async fn sync(&self, device: &Device) -> Result<SyncContribution, CoreError> {
        let version = device.agent_version();
        if !compat::supports(Feature::Notifications, &version) {
            return Ok(SyncContribution::default());
        }
        let state = device.state(Feature::Notifications);
        let config = if state.status.wants_installed() {
            self.ctx.store.notifications(&device.org).await?
        } else {
            None
        };

        Ok(match config {
            Some(config) => SyncContribution::new(
                vec![Task::agent(
                    messages::ADD_NOTIFICATIONS,
                    transform_notifications(&config, &version),
                )],
                json!(Synced {
                    installed: true,
                    revision: Some(config.revision),
                }),
            ),
            None => SyncContribution {
                requests: Vec::new(),
                complete_data: json!(Synced {
                    installed: false,
                    revision: None,
                }),
                call_complete: state.status != FeatureStatus::None,
            },
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        self.ctx
            .settle_synced_singleton(self.method(), device, data, sync_time)
            .await;
    }
}
