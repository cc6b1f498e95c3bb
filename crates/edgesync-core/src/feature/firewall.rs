// ── Firewall policy ──

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use super::{
    Action, ApplyOutcome, ApplyRequest, ChangeSet, DevicePlanner, FeatureContext, FeatureModule,
    Outcome, Plan, StateChange, SyncContribution, Synced, app_identification, request_data,
    revert_changes,
};
use crate::compat::{messages, transform_firewall};
use crate::error::CoreError;
use crate::model::{
    AppClient, AppIdentification, Device, DeviceId, Feature, FeatureStatus, FirewallPolicy, Job,
    OrgId, PolicyId, Task,
};

#[derive(Debug, Deserialize)]
struct FirewallRequest {
    action: Action,
    #[serde(default)]
    id: Option<PolicyId>,
}

struct FirewallPlanner {
    action: Action,
    id: Option<PolicyId>,
    policy: Option<FirewallPolicy>,
    app_dbs: BTreeMap<OrgId, AppIdentification>,
}

impl FirewallPlanner {
    fn plan_install(
        &self,
        device: &mut Device,
        policy: &FirewallPolicy,
        now: DateTime<Utc>,
    ) -> Option<Plan> {
        if device
            .state(Feature::FirewallPolicy)
            .targets(Some(&policy.id), None)
        {
            return None;
        }

        let mut tasks = Vec::new();
        let mut changes = vec![StateChange {
            feature: Feature::FirewallPolicy,
            install: true,
            request_time: now,
        }];
        let mut after = None;
        if policy.uses_applications() {
            let step = app_identification::install_prerequisite(
                device,
                AppClient::FirewallPolicy,
                self.app_dbs.get(&device.org),
                now,
            );
            if let Some((task, change)) = step {
                tasks.push(task);
                changes.push(change);
            }
        } else if device.app_clients.contains(&AppClient::FirewallPolicy) {
            after = app_identification::teardown(device, AppClient::FirewallPolicy, now);
        }

        tasks.push(Task::agent(
            messages::ADD_FIREWALL_POLICY,
            transform_firewall(policy, &device.agent_version()),
        ));
        if let Some((task, change)) = after {
            tasks.push(task);
            changes.push(change);
        }

        let state = device.state_mut(Feature::FirewallPolicy);
        state.begin(FeatureStatus::Installing, now);
        state.policy = Some(policy.id.clone());

        Some(Plan {
            title: format!("Install firewall policy {}", policy.name),
            tasks,
            data: json!(ChangeSet {
                request_time: now,
                changes,
            }),
            options: None,
        })
    }

    fn plan_uninstall(&self, device: &mut Device, now: DateTime<Utc>) -> Option<Plan> {
        let state = device.state(Feature::FirewallPolicy);
        if matches!(
            state.status,
            FeatureStatus::None | FeatureStatus::Uninstalling
        ) {
            return None;
        }
        if self.id.is_some() && state.policy != self.id {
            return None;
        }

        let mut tasks = vec![Task::agent(
            messages::REMOVE_FIREWALL_POLICY,
            json!({ "id": state.policy }),
        )];
        let mut changes = vec![StateChange {
            feature: Feature::FirewallPolicy,
            install: false,
            request_time: now,
        }];
        if let Some((task, change)) =
            app_identification::teardown(device, AppClient::FirewallPolicy, now)
        {
            tasks.push(task);
            changes.push(change);
        }
        device
            .state_mut(Feature::FirewallPolicy)
            .begin(FeatureStatus::Uninstalling, now);

        Some(Plan {
            title: "Uninstall firewall policy".into(),
            tasks,
            data: json!(ChangeSet {
                request_time: now,
                changes,
            }),
            options: None,
        })
    }
}

impl DevicePlanner for FirewallPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        match (self.action, &self.policy) {
            (Action::Install, Some(policy)) => Ok(self.plan_install(device, policy, now)),
            (Action::Install, None) => Err(CoreError::validation("install requires a policy id")),
            (Action::Uninstall, _) => Ok(self.plan_uninstall(device, now)),
        }
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        revert_changes(device, data);
    }
}

pub struct FirewallModule {
    ctx: Arc<FeatureContext>,
}

impl FirewallModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FeatureModule for FirewallModule {
    fn method(&self) -> Feature {
        Feature::FirewallPolicy
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: FirewallRequest = request_data(self.method(), &request.data)?;
        let mut policy = None;
        let mut app_dbs = BTreeMap::new();
        if body.action == Action::Install {
            let id = body
                .id
                .as_ref()
                .ok_or_else(|| CoreError::validation("install requires a policy id"))?;
            let doc = self
                .ctx
                .store
                .firewall_policy(id)
                .await?
                .ok_or_else(|| CoreError::policy_not_found("Firewall policy", id))?;
            if doc.uses_applications() {
                for org in self.ctx.orgs_of(&request.devices).await? {
                    if let Some(db) = self.ctx.store.app_identification(&org).await? {
                        app_dbs.insert(org, db);
                    }
                }
            }
            policy = Some(doc);
        }

        let planner = FirewallPlanner {
            action: body.action,
            id: body.id,
            policy,
            app_dbs,
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
        let state = device.state(Feature::FirewallPolicy);
        let mut requests = Vec::new();
        if let (true, Some(id)) = (state.status.wants_installed(), &state.policy) {
            match self.ctx.store.firewall_policy(id).await? {
                Some(policy) => requests.push(Task::agent(
                    messages::ADD_FIREWALL_POLICY,
                    transform_firewall(&policy, &device.agent_version()),
                )),
                None => warn!(device = %device.id, policy = %id, "firewall policy referenced but missing"),
            }
        }
        let installed = !requests.is_empty();
        Ok(SyncContribution {
            requests,
            complete_data: json!(Synced {
                installed,
                revision: None,
            }),
            call_complete: installed || state.status != FeatureStatus::None,
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        self.ctx
            .settle_synced_singleton(self.method(), device, data, sync_time)
            .await;
    }
}
