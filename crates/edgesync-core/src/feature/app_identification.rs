// ── Application identification ──
//
// The application-signature DB is a shared prerequisite: the operator,
// QoS and firewall all need it on the device. `app_clients` records who
// does, and the DB is removed only once nobody is left.

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
use crate::compat::{messages, transform_app_identification};
use crate::error::CoreError;
use crate::model::{
    AppClient, AppIdentification, Device, DeviceId, Feature, FeatureStatus, Job, OrgId, Task,
};

/// Install the DB for `client` when the device lacks the current
/// revision. Always records `client`.
pub(crate) fn install_prerequisite(
    device: &mut Device,
    client: AppClient,
    db: Option<&AppIdentification>,
    now: DateTime<Utc>,
) -> Option<(Task, StateChange)> {
    device.app_clients.insert(client);
    let db = db?;
    let version = device.agent_version();
    let state = device.state_mut(Feature::AppIdentification);
    if state.targets(None, Some(db.revision)) {
        return None;
    }
    state.begin(FeatureStatus::Installing, now);
    state.revision = Some(db.revision);
    Some((
        Task::agent(
            messages::ADD_APPLICATION,
            transform_app_identification(db, &version),
        ),
        StateChange {
            feature: Feature::AppIdentification,
            install: true,
            request_time: now,
        },
    ))
}

/// Drop `client`; remove the DB when it was the last one.
pub(crate) fn teardown(
    device: &mut Device,
    client: AppClient,
    now: DateTime<Utc>,
) -> Option<(Task, StateChange)> {
    device.app_clients.remove(&client);
    if !device.app_clients.is_empty() {
        return None;
    }
    let state = device.state_mut(Feature::AppIdentification);
    if matches!(
        state.status,
        FeatureStatus::None | FeatureStatus::Uninstalling
    ) {
        return None;
    }
    state.begin(FeatureStatus::Uninstalling, now);
    Some((
        Task::agent(messages::REMOVE_APPLICATION, json!({})),
        StateChange {
            feature: Feature::AppIdentification,
            install: false,
            request_time: now,
        },
    ))
}

#[derive(Debug, Deserialize)]
struct OperatorRequest {
    action: Action,
}

struct OperatorPlanner {
    action: Action,
    dbs: BTreeMap<OrgId, AppIdentification>,
}

impl DevicePlanner for OperatorPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let (title, step) = match self.action {
            Action::Install => {
                let db = self.dbs.get(&device.org).ok_or_else(|| {
                    CoreError::policy_not_found("Application identification", &device.org)
                })?;
                let fresh = !device.app_clients.contains(&AppClient::Operator);
                let step = install_prerequisite(device, AppClient::Operator, Some(db), now);
                if step.is_none() && !fresh {
                    return Ok(None);
                }
                ("Install application identification", step)
            }
            Action::Uninstall => {
                if !device.app_clients.contains(&AppClient::Operator) {
                    return Ok(None);
                }
                (
                    "Uninstall application identification",
                    teardown(device, AppClient::Operator, now),
                )
            }
        };

        let (tasks, changes) = step.map(|(t, c)| (vec![t], vec![c])).unwrap_or_default();
        Ok(Some(Plan {
            title: title.into(),
            tasks,
            data: json!(ChangeSet {
                request_time: now,
                changes,
            }),
            options: None,
        }))
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        revert_changes(device, data);
    }
}

pub struct AppIdentificationModule {
    ctx: Arc<FeatureContext>,
}

impl AppIdentificationModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FeatureModule for AppIdentificationModule {
    fn method(&self) -> Feature {
        Feature::AppIdentification
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: OperatorRequest = request_data(self.method(), &request.data)?;
        let mut dbs = BTreeMap::new();
        if body.action == Action::Install {
            for org in self.ctx.orgs_of(&request.devices).await? {
                if let Some(db) = self.ctx.store.app_identification(&org).await? {
                    dbs.insert(org, db);
                }
            }
        }
        let planner = OperatorPlanner {
            action: body.action,
            dbs,
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
        let db = self.ctx.store.app_identification(&device.org).await?;
        let status = device.state(Feature::AppIdentification).status;
        Ok(match db {
            Some(db) if !device.app_clients.is_empty() => SyncContribution::new(
                vec![Task::agent(
                    messages::ADD_APPLICATION,
                    transform_app_identification(&db, &device.agent_version()),
                )],
                json!(Synced {
                    installed: true,
                    revision: Some(db.revision),
                }),
            ),
            _ => SyncContribution {
                requests: Vec::new(),
                complete_data: json!(Synced {
                    installed: false,
                    revision: None,
                }),
                call_complete: status != FeatureStatus::None,
            },
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        self.ctx
            .settle_synced_singleton(self.method(), device, data, sync_time)
            .await;
    }
}
