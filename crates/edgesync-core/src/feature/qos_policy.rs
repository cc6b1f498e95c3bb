// ── QoS policy ──
//
// A device carries a default QoS policy plus optional per-WAN-interface
// overrides. Jobs describe the change between the effective
// interface-to-policy mapping before and after the request, preceded by
// the traffic map and application DB prerequisites when the device lacks
// them, and followed by the application DB teardown once no policy is
// left.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::{
    Action, ApplyOutcome, ApplyRequest, DevicePlanner, FeatureContext, FeatureModule, Outcome,
    Plan, StateChange, SyncContribution, Synced, app_identification, request_data, settle_change,
    traffic_map,
};
use crate::compat::{self, messages, transform_qos_policy};
use crate::error::CoreError;
use crate::model::{
    AgentVersion, AppClient, AppIdentification, Device, DeviceId, Feature, FeatureStatus,
    InterfaceKind, Job, OrgId, PolicyId, QosPolicy, Task, TrafficMap,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QosRequest {
    action: Action,
    #[serde(default)]
    id: Option<PolicyId>,
    /// Interface overrides per device; devices not listed get `id` as
    /// their default policy.
    #[serde(default)]
    interfaces: Option<BTreeMap<DeviceId, Vec<String>>>,
    /// Keep the device default when installing interface overrides.
    #[serde(default)]
    keep_device_policy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QosJobData {
    request_time: DateTime<Utc>,
    action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy: Option<PolicyId>,
    /// Some interface still carries a policy after the job.
    remaining: bool,
    changes: Vec<StateChange>,
}

impl QosJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        self.changes.iter().fold(false, |any, change| {
            let change = if change.feature == Feature::QosPolicy
                && outcome == Outcome::Completed
                && self.remaining
            {
                StateChange {
                    install: true,
                    ..change.clone()
                }
            } else {
                change.clone()
            };
            settle_change(device, &change, outcome) | any
        })
    }
}

/// Effective policy per assigned WAN interface.
fn interface_policies(device: &Device) -> BTreeMap<String, PolicyId> {
    let default = device.state(Feature::QosPolicy).policy;
    device
        .wan_interfaces()
        .filter_map(|ifc| {
            ifc.qos_policy
                .clone()
                .or_else(|| default.clone())
                .map(|p| (ifc.dev_id.clone(), p))
        })
        .collect()
}

/// `remove-qos-policy` for interfaces that lost their policy, then
/// `add-qos-policy` for interfaces that gained one. With `resend`, every
/// interface mapped to `resend` is re-added.
fn diff_tasks(
    before: &BTreeMap<String, PolicyId>,
    after: &BTreeMap<String, PolicyId>,
    resend: Option<&PolicyId>,
    policies: &BTreeMap<PolicyId, QosPolicy>,
    version: &AgentVersion,
) -> Result<Vec<Task>, CoreError> {
    let mut removed: BTreeMap<&PolicyId, Vec<&str>> = BTreeMap::new();
    for (dev_id, old) in before {
        if after.get(dev_id) != Some(old) {
            removed.entry(old).or_default().push(dev_id);
        }
    }
    let mut added: BTreeMap<&PolicyId, Vec<String>> = BTreeMap::new();
    for (dev_id, new) in after {
        if before.get(dev_id) != Some(new) || resend == Some(new) {
            added.entry(new).or_default().push(dev_id.clone());
        }
    }

    let mut tasks = Vec::with_capacity(removed.len() + added.len());
    for (id, interfaces) in removed {
        tasks.push(Task::agent(
            messages::REMOVE_QOS_POLICY,
            json!({ "id": id, "interfaces": interfaces }),
        ));
    }
    for (id, interfaces) in added {
        let policy = policies
            .get(id)
            .ok_or_else(|| CoreError::policy_not_found("QoS policy", id))?;
        tasks.push(Task::agent(
            messages::ADD_QOS_POLICY,
            transform_qos_policy(policy, &interfaces, version),
        ));
    }
    Ok(tasks)
}

struct QosPlanner {
    action: Action,
    id: Option<PolicyId>,
    interfaces: Option<BTreeMap<DeviceId, Vec<String>>>,
    keep_device_policy: bool,
    policies: BTreeMap<PolicyId, QosPolicy>,
    traffic_maps: BTreeMap<OrgId, TrafficMap>,
    app_dbs: BTreeMap<OrgId, AppIdentification>,
}

impl QosPlanner {
    fn plan_install(
        &self,
        device: &mut Device,
        id: &PolicyId,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        compat::require(Feature::QosPolicy, device)?;
        let version = device.agent_version();
        let before = interface_policies(device);
        let status = device.state(Feature::QosPolicy).status;

        match self.interfaces.as_ref().and_then(|m| m.get(&device.id)) {
            Some(dev_ids) => {
                for dev_id in dev_ids {
                    let ifc = device.interface_mut(dev_id).ok_or_else(|| {
                        CoreError::validation(format!("unknown interface {dev_id}"))
                    })?;
                    if !ifc.assigned || ifc.kind != InterfaceKind::Wan {
                        return Err(CoreError::validation(format!(
                            "interface {dev_id} is not an assigned WAN interface"
                        )));
                    }
                    ifc.qos_policy = Some(id.clone());
                }
                if !self.keep_device_policy {
                    device.state_mut(Feature::QosPolicy).policy = None;
                }
            }
            None => device.state_mut(Feature::QosPolicy).policy = Some(id.clone()),
        }

        let after = interface_policies(device);
        if after.is_empty() {
            return Err(CoreError::validation(format!(
                "device {} has no assigned WAN interfaces",
                device.id
            )));
        }
        let settled = matches!(
            status,
            FeatureStatus::Installed | FeatureStatus::Installing
        );
        if settled && after == before {
            return Ok(None);
        }

        let mut tasks = Vec::new();
        let mut changes = vec![StateChange {
            feature: Feature::QosPolicy,
            install: true,
            request_time: now,
        }];
        let prerequisites = [
            app_identification::install_prerequisite(
                device,
                AppClient::QosPolicy,
                self.app_dbs.get(&device.org),
                now,
            ),
            traffic_map::install_prerequisite(device, self.traffic_maps.get(&device.org), now),
        ];
        for (task, change) in prerequisites.into_iter().flatten() {
            tasks.push(task);
            changes.push(change);
        }
        let resend = (!settled).then_some(id);
        tasks.extend(diff_tasks(&before, &after, resend, &self.policies, &version)?);

        device
            .state_mut(Feature::QosPolicy)
            .begin(FeatureStatus::Installing, now);

        let name = self.policies.get(id).map_or(id.as_str(), |p| p.name.as_str());
        Ok(Some(Plan {
            title: format!("Install QoS policy {name}"),
            tasks,
            data: json!(QosJobData {
                request_time: now,
                action: Action::Install,
                policy: Some(id.clone()),
                remaining: true,
                changes,
            }),
            options: None,
        }))
    }

    fn plan_uninstall(
        &self,
        device: &mut Device,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let version = device.agent_version();
        let original = device.clone();
        let before = interface_policies(device);

        let matches = |p: &Option<PolicyId>| match &self.id {
            Some(id) => p.as_ref() == Some(id),
            None => p.is_some(),
        };
        for ifc in &mut device.interfaces {
            if matches(&ifc.qos_policy) {
                ifc.qos_policy = None;
            }
        }
        let state = device.state_mut(Feature::QosPolicy);
        if matches(&state.policy) {
            state.policy = None;
        }

        let after = interface_policies(device);
        if after == before {
            // Only references to interfaces the policy never reached changed.
            return Ok((*device != original).then(|| Plan {
                title: "Clear QoS references".into(),
                tasks: Vec::new(),
                data: Value::Null,
                options: None,
            }));
        }

        let mut tasks = diff_tasks(&before, &after, None, &self.policies, &version)?;
        let mut changes = vec![StateChange {
            feature: Feature::QosPolicy,
            install: false,
            request_time: now,
        }];
        if after.is_empty() {
            if let Some((task, change)) =
                app_identification::teardown(device, AppClient::QosPolicy, now)
            {
                tasks.push(task);
                changes.push(change);
            }
        }

        device
            .state_mut(Feature::QosPolicy)
            .begin(FeatureStatus::Uninstalling, now);

        Ok(Some(Plan {
            title: "Uninstall QoS policy".into(),
            tasks,
            data: json!(QosJobData {
                request_time: now,
                action: Action::Uninstall,
                policy: self.id.clone(),
                remaining: !after.is_empty(),
                changes,
            }),
            options: None,
        }))
    }
}

impl DevicePlanner for QosPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        match (self.action, &self.id) {
            (Action::Install, Some(id)) => self.plan_install(device, id, now),
            (Action::Install, None) => Err(CoreError::validation("install requires a policy id")),
            (Action::Uninstall, _) => self.plan_uninstall(device, now),
        }
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<QosJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct QosPolicyModule {
    ctx: Arc<FeatureContext>,
}

impl QosPolicyModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    /// Every QoS policy a device references, by default or override.
    async fn referenced_policies(
        &self,
        devices: &[Device],
        into: &mut BTreeMap<PolicyId, QosPolicy>,
    ) -> Result<(), CoreError> {
        for device in devices {
            let ids = device
                .interfaces
                .iter()
                .filter_map(|i| i.qos_policy.clone())
                .chain(device.state(Feature::QosPolicy).policy);
            for id in ids {
                if into.contains_key(&id) {
                    continue;
                }
                if let Some(policy) = self.ctx.store.qos_policy(&id).await? {
                    into.insert(id, policy);
                }
            }
        }
        Ok(())
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<QosJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for QosPolicyModule {
    fn method(&self) -> Feature {
        Feature::QosPolicy
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: QosRequest = request_data(self.method(), &request.data)?;

        let mut devices = Vec::with_capacity(request.devices.len());
        for id in &request.devices {
            devices.push(self.ctx.load_device(id).await?);
        }

        let mut policies = BTreeMap::new();
        let mut traffic_maps = BTreeMap::new();
        let mut app_dbs = BTreeMap::new();
        match body.action {
            Action::Install => {
                let id = body
                    .id
                    .as_ref()
                    .ok_or_else(|| CoreError::validation("install requires a policy id"))?;
                let policy = self
                    .ctx
                    .store
                    .qos_policy(id)
                    .await?
                    .ok_or_else(|| CoreError::policy_not_found("QoS policy", id))?;
                policies.insert(id.clone(), policy);
                for device in &devices {
                    if traffic_maps.contains_key(&device.org) {
                        continue;
                    }
                    if let Some(map) = self.ctx.store.traffic_map(&device.org).await? {
                        traffic_maps.insert(device.org.clone(), map);
                    }
                    if let Some(db) = self.ctx.store.app_identification(&device.org).await? {
                        app_dbs.insert(device.org.clone(), db);
                    }
                }
            }
            Action::Uninstall => self.referenced_policies(&devices, &mut policies).await?,
        }

        let planner = QosPlanner {
            action: body.action,
            id: body.id,
            interfaces: body.interfaces,
            keep_device_policy: body.keep_device_policy,
            policies,
            traffic_maps,
            app_dbs,
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

    async fn sync(&self, device: &Device) -> Result<SyncContribution, CoreError> {
        let version = device.agent_version();
        if !compat::supports(Feature::QosPolicy, &version) {
            return Ok(SyncContribution::default());
        }
        let mut policies = BTreeMap::new();
        self.referenced_policies(std::slice::from_ref(device), &mut policies)
            .await?;

        let mut requests = Vec::new();
        for (id, interfaces) in device.effective_qos() {
            match policies.get(&id) {
                Some(policy) => requests.push(Task::agent(
                    messages::ADD_QOS_POLICY,
                    transform_qos_policy(policy, &interfaces, &version),
                )),
                None => warn!(device = %device.id, policy = %id, "QoS policy referenced but missing"),
            }
        }

        let installed = !requests.is_empty();
        let status = device.state(Feature::QosPolicy).status;
        Ok(SyncContribution {
            requests,
            complete_data: json!(Synced {
                installed,
                revision: None,
            }),
            call_complete: installed || status != FeatureStatus::None,
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        self.ctx
            .settle_synced_singleton(self.method(), device, data, sync_time)
            .await;
    }
}
