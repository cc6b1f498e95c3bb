// ── DHCP server ──
//
// One DHCP configuration per LAN interface, stored on the device. A
// modify is sent as remove-then-add in one aggregated job and keeps the
// previous entry in the job data so a failure can restore it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::{
    ApplyOutcome, ApplyRequest, DevicePlanner, EntriesSynced, FeatureContext, FeatureModule,
    Outcome, Plan, SyncContribution, request_data,
};
use crate::compat::{messages, transform_dhcp};
use crate::error::CoreError;
use crate::model::{
    AgentVersion, Device, DeviceId, DhcpConfig, DhcpEntry, Feature, FeatureState, FeatureStatus,
    InterfaceKind, Job, PolicyId, Task,
};

pub(crate) fn add_task(config: &DhcpConfig, routers: Option<&str>, version: &AgentVersion) -> Task {
    Task::agent(
        messages::ADD_DHCP_CONFIG,
        transform_dhcp(config, routers, version),
    )
}

pub(crate) fn remove_task(
    config: &DhcpConfig,
    routers: Option<&str>,
    version: &AgentVersion,
) -> Task {
    Task::agent(
        messages::REMOVE_DHCP_CONFIG,
        transform_dhcp(config, routers, version),
    )
}

/// Re-send the DHCP configuration on `interface` with a new gateway.
/// Used when VRRP membership or the interface address changes.
pub(crate) fn reissue(
    device: &Device,
    interface: &str,
    old_routers: Option<&str>,
    new_routers: Option<&str>,
) -> Vec<Task> {
    let version = device.agent_version();
    device
        .dhcp
        .iter()
        .filter(|e| e.config.interface == interface && !e.state.status.pending_removal())
        .flat_map(|e| {
            [
                remove_task(&e.config, old_routers, &version),
                add_task(&e.config, new_routers, &version),
            ]
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DhcpAction {
    Add,
    Remove,
    Modify,
}

#[derive(Debug, Deserialize)]
struct DhcpRequest {
    action: DhcpAction,
    #[serde(default)]
    dhcp: Option<DhcpConfig>,
    #[serde(default)]
    id: Option<PolicyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhcpJobData {
    request_time: DateTime<Utc>,
    action: DhcpAction,
    id: PolicyId,
    /// Entry as it was before a modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original: Option<DhcpEntry>,
    /// State before a remove, restored if the removal never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<FeatureState>,
}

impl DhcpJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        let Some(idx) = device.dhcp.iter().position(|e| e.config.id == self.id) else {
            return false;
        };
        if !device.dhcp[idx].state.is_current(self.request_time) {
            return false;
        }
        if self.action == DhcpAction::Remove && outcome == Outcome::Completed {
            device.dhcp.remove(idx);
            return true;
        }
        let entry = &mut device.dhcp[idx];
        match (self.action, outcome) {
            (DhcpAction::Remove, Outcome::Failed) => {
                entry.state.status = FeatureStatus::UninstallFailed;
            }
            (DhcpAction::Remove, _) => entry.state.restore(self.previous.as_ref()),
            (DhcpAction::Add | DhcpAction::Modify, Outcome::Completed) => {
                entry.state.status = FeatureStatus::Installed;
            }
            (DhcpAction::Modify, _) => {
                if let Some(original) = &self.original {
                    entry.config = original.config.clone();
                }
                entry.state.status = outcome.status(true);
            }
            (DhcpAction::Add, _) => entry.state.status = outcome.status(true),
        }
        true
    }
}

/// DHCP only runs on assigned LAN interfaces, one configuration each.
fn check_interface(device: &Device, config: &DhcpConfig) -> Result<(), CoreError> {
    let ifc = device.interface(&config.interface).ok_or_else(|| {
        CoreError::validation(format!("unknown interface {}", config.interface))
    })?;
    if !ifc.assigned || ifc.kind != InterfaceKind::Lan {
        return Err(CoreError::validation(format!(
            "interface {} is not an assigned LAN interface",
            config.interface
        )));
    }
    let taken = device
        .dhcp
        .iter()
        .any(|e| e.config.interface == config.interface && e.config.id != config.id);
    if taken {
        return Err(CoreError::validation(format!(
            "interface {} already has a DHCP configuration",
            config.interface
        )));
    }
    Ok(())
}

struct DhcpPlanner {
    action: DhcpAction,
    id: PolicyId,
    config: Option<DhcpConfig>,
}

impl DhcpPlanner {
    fn config(&self) -> Result<&DhcpConfig, CoreError> {
        self.config
            .as_ref()
            .ok_or_else(|| CoreError::validation("missing dhcp configuration"))
    }

    fn plan_add(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let config = self.config()?;
        check_interface(device, config)?;
        match device.dhcp_entry(&config.id) {
            Some(entry) if entry.config != *config => {
                return Err(CoreError::validation(format!(
                    "DHCP configuration {} already exists, use modify",
                    config.id
                )));
            }
            Some(entry)
                if matches!(
                    entry.state.status,
                    FeatureStatus::Installed | FeatureStatus::Installing
                ) =>
            {
                return Ok(None);
            }
            Some(_) => {}
            None => device.dhcp.push(DhcpEntry {
                config: config.clone(),
                state: FeatureState::default(),
            }),
        }

        let routers = device.dhcp_routers(&config.interface);
        let task = add_task(config, routers.as_deref(), &device.agent_version());
        if let Some(entry) = device.dhcp_entry_mut(&config.id) {
            entry.state.begin(FeatureStatus::Installing, now);
        }
        Ok(Some(self.job_plan(
            format!("Add DHCP on {}", config.interface),
            vec![task],
            now,
            None,
            None,
        )))
    }

    fn plan_remove(
        &self,
        device: &mut Device,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let version = device.agent_version();
        let entry = device
            .dhcp_entry(&self.id)
            .ok_or_else(|| CoreError::validation(format!("unknown DHCP configuration {}", self.id)))?;
        if entry.state.status == FeatureStatus::Uninstalling {
            return Ok(None);
        }
        let previous = entry.state.clone();
        let routers = device.dhcp_routers(&entry.config.interface);
        let task = remove_task(&entry.config, routers.as_deref(), &version);
        let title = format!("Remove DHCP on {}", entry.config.interface);
        if let Some(entry) = device.dhcp_entry_mut(&self.id) {
            entry.state.begin(FeatureStatus::Uninstalling, now);
        }
        Ok(Some(self.job_plan(title, vec![task], now, None, Some(previous))))
    }

    fn plan_modify(
        &self,
        device: &mut Device,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let config = self.config()?;
        check_interface(device, config)?;
        let version = device.agent_version();
        let original = device
            .dhcp_entry(&config.id)
            .cloned()
            .ok_or_else(|| CoreError::validation(format!("unknown DHCP configuration {}", config.id)))?;
        if original.config == *config
            && matches!(
                original.state.status,
                FeatureStatus::Installed | FeatureStatus::Installing
            )
        {
            return Ok(None);
        }

        let old_routers = device.dhcp_routers(&original.config.interface);
        let new_routers = device.dhcp_routers(&config.interface);
        let tasks = vec![
            remove_task(&original.config, old_routers.as_deref(), &version),
            add_task(config, new_routers.as_deref(), &version),
        ];
        if let Some(entry) = device.dhcp_entry_mut(&config.id) {
            entry.config = config.clone();
            entry.state.begin(FeatureStatus::Installing, now);
        }
        Ok(Some(self.job_plan(
            format!("Modify DHCP on {}", config.interface),
            tasks,
            now,
            Some(original),
            None,
        )))
    }

    fn job_plan(
        &self,
        title: String,
        tasks: Vec<Task>,
        now: DateTime<Utc>,
        original: Option<DhcpEntry>,
        previous: Option<FeatureState>,
    ) -> Plan {
        Plan {
            title,
            tasks,
            data: json!(DhcpJobData {
                request_time: now,
                action: self.action,
                id: self.id.clone(),
                original,
                previous,
            }),
            options: None,
        }
    }
}

impl DevicePlanner for DhcpPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        match self.action {
            DhcpAction::Add => self.plan_add(device, now),
            DhcpAction::Remove => self.plan_remove(device, now),
            DhcpAction::Modify => self.plan_modify(device, now),
        }
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<DhcpJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct DhcpModule {
    ctx: Arc<FeatureContext>,
}

impl DhcpModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<DhcpJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for DhcpModule {
    fn method(&self) -> Feature {
        Feature::Dhcp
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: DhcpRequest = request_data(self.method(), &request.data)?;
        let id = body
            .id
            .clone()
            .or_else(|| body.dhcp.as_ref().map(|c| c.id.clone()))
            .ok_or_else(|| CoreError::validation("missing dhcp id"))?;
        let planner = DhcpPlanner {
            action: body.action,
            id,
            config: body.dhcp,
        };
        self.ctx.submit(self.method(), request, &planner).await
    }

    async fn complete(&self, job: &Job, _result: &Value) {
        self.settle(job, Outcome::Completed).await;
    }

    async fn error(&self, job: &Job, reason: &str) {
        warn!(job = %job.id, device = %job.device, reason, "DHCP job failed");
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
        let mut synced = EntriesSynced::default();
        let mut requests = Vec::new();
        for entry in &device.dhcp {
            if entry.state.status.pending_removal() {
                synced.removed.push(entry.config.id.clone());
            } else {
                let routers = device.dhcp_routers(&entry.config.interface);
                requests.push(add_task(&entry.config, routers.as_deref(), &version));
                synced.installed.push(entry.config.id.clone());
            }
        }
        Ok(SyncContribution {
            requests,
            complete_data: json!(synced),
            call_complete: !device.dhcp.is_empty(),
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        let Ok(synced) = serde_json::from_value::<EntriesSynced>(data.clone()) else {
            warn!(device = %device, "unreadable DHCP sync data");
            return;
        };
        self.ctx
            .settle_device(self.method(), device, None, "sync confirmation", |dev| {
                let before = dev.dhcp.len();
                dev.dhcp.retain(|e| {
                    !(synced.removed.contains(&e.config.id)
                        && e.state.not_newer_than(sync_time))
                });
                let mut changed = dev.dhcp.len() != before;
                for entry in &mut dev.dhcp {
                    if synced.installed.contains(&entry.config.id)
                        && entry.state.not_newer_than(sync_time)
                        && entry.state.status != FeatureStatus::Installed
                    {
                        entry.state.status = FeatureStatus::Installed;
                        changed = true;
                    }
                }
                changed
            })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Interface;

    fn lan(dev_id: &str) -> Interface {
        Interface {
            dev_id: dev_id.into(),
            name: dev_id.into(),
            assigned: true,
            kind: InterfaceKind::Lan,
            ip: Some("192.168.1.2/24".into()),
            gateway: None,
            metric: None,
            routing: Vec::new(),
            qos_policy: None,
        }
    }

    fn config(range_end: &str) -> DhcpConfig {
        DhcpConfig {
            id: "dh1".into(),
            interface: "L".into(),
            range_start: "192.168.1.10".into(),
            range_end: range_end.into(),
            dns: vec!["8.8.8.8".into()],
            mac_assign: Vec::new(),
            options: Vec::new(),
        }
    }

    fn planner(action: DhcpAction, range_end: &str) -> DhcpPlanner {
        DhcpPlanner {
            action,
            id: "dh1".into(),
            config: Some(config(range_end)),
        }
    }

    fn device() -> Device {
        let mut dev = Device::new("d1", "o1");
        dev.versions.agent = Some("6.2.0".into());
        dev.interfaces = vec![lan("L")];
        dev
    }

    #[test]
    fn add_sends_interface_address_as_router() {
        let mut dev = device();
        let plan = planner(DhcpAction::Add, "192.168.1.50")
            .plan(&mut dev, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(plan.tasks[0].params["routers"], "192.168.1.2");
        assert_eq!(
            dev.dhcp_entry(&"dh1".into()).unwrap().state.status,
            FeatureStatus::Installing
        );
    }

    #[test]
    fn modify_failure_restores_original_config() {
        let mut dev = device();
        let now = Utc::now();
        planner(DhcpAction::Add, "192.168.1.50")
            .plan(&mut dev, now)
            .unwrap();
        dev.dhcp[0].state.status = FeatureStatus::Installed;
        let before = dev.dhcp[0].config.clone();

        let later = now + chrono::Duration::seconds(1);
        let plan = planner(DhcpAction::Modify, "192.168.1.99")
            .plan(&mut dev, later)
            .unwrap()
            .unwrap();
        let names: Vec<_> = plan.tasks.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(
            names,
            vec![messages::REMOVE_DHCP_CONFIG, messages::ADD_DHCP_CONFIG]
        );
        assert_eq!(dev.dhcp[0].config.range_end, "192.168.1.99");

        let data: DhcpJobData = serde_json::from_value(plan.data).unwrap();
        assert!(data.settle(&mut dev, Outcome::Failed));
        assert_eq!(dev.dhcp[0].config, before);
        assert_eq!(dev.dhcp[0].state.status, FeatureStatus::InstallFailed);
    }

    #[test]
    fn wan_interface_is_rejected() {
        let mut dev = device();
        dev.interfaces[0].kind = InterfaceKind::Wan;
        let err = planner(DhcpAction::Add, "192.168.1.50")
            .plan(&mut dev, Utc::now())
            .err()
            .unwrap();
        assert!(err.is_validation());
    }

    #[test]
    fn completed_remove_drops_entry() {
        let mut dev = device();
        let now = Utc::now();
        planner(DhcpAction::Add, "192.168.1.50")
            .plan(&mut dev, now)
            .unwrap();
        let later = now + chrono::Duration::seconds(1);
        let plan = planner(DhcpAction::Remove, "192.168.1.50")
            .plan(&mut dev, later)
            .unwrap()
            .unwrap();
        let data: DhcpJobData = serde_json::from_value(plan.data).unwrap();
        assert!(data.settle(&mut dev, Outcome::Completed));
        assert!(dev.dhcp.is_empty());
    }
}
