// ── VRRP groups ──
//
// Applying a group compares its member list with the devices currently
// running it. Joining and leaving members also get their LAN DHCP
// re-issued so clients use the virtual address (or stop using it). Each
// device gets one aggregated job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::{
    Action, ApplyOutcome, ApplyRequest, DevicePlanner, EntriesSynced, FeatureContext,
    FeatureModule, Outcome, Plan, SyncContribution, dhcp, request_data,
};
use crate::compat::{self, messages, transform_vrrp};
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, Feature, FeatureState, FeatureStatus, InterfaceKind, Job, PolicyId, Task,
    VrrpGroup, VrrpMember, VrrpMembership,
};

#[derive(Debug, Deserialize)]
struct VrrpRequest {
    action: Action,
    #[serde(alias = "id")]
    group: PolicyId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    Join,
    Stay,
    Leave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VrrpJobData {
    request_time: DateTime<Utc>,
    group: PolicyId,
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<FeatureState>,
}

impl VrrpJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        let Some(membership) = device.vrrp.get_mut(&self.group) else {
            return false;
        };
        if !membership.state.is_current(self.request_time) {
            return false;
        }
        match (self.role, outcome) {
            (Role::Leave, Outcome::Completed) => {
                device.vrrp.remove(&self.group);
            }
            (Role::Leave, Outcome::Failed) => {
                membership.state.status = FeatureStatus::UninstallFailed;
            }
            (Role::Leave, _) => membership.state.restore(self.previous.as_ref()),
            (Role::Join | Role::Stay, _) => membership.state.status = outcome.status(true),
        }
        true
    }
}

fn leave_task(membership: &VrrpMembership) -> Task {
    Task::agent(
        messages::REMOVE_VRRP_GROUP,
        json!({
            "virtualRouterId": membership.virtual_router_id,
            "virtualIp": membership.virtual_ip,
            "devId": membership.interface,
        }),
    )
}

struct VrrpPlanner {
    group_id: PolicyId,
    /// `None` when uninstalling.
    group: Option<VrrpGroup>,
}

impl VrrpPlanner {
    fn plan_member(
        &self,
        device: &mut Device,
        group: &VrrpGroup,
        member: &VrrpMember,
        was_member: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        compat::require(Feature::Vrrp, device)?;
        let ifc = device.interface(&member.interface).ok_or_else(|| {
            CoreError::validation(format!("unknown interface {}", member.interface))
        })?;
        if !ifc.assigned || ifc.kind != InterfaceKind::Lan {
            return Err(CoreError::validation(format!(
                "interface {} is not an assigned LAN interface",
                member.interface
            )));
        }
        let version = device.agent_version();
        let params = transform_vrrp(group, member, &version);
        let current = device.vrrp.get(&group.id).cloned();
        if current.as_ref().is_some_and(|m| {
            m.interface == member.interface
                && m.params == params
                && matches!(
                    m.state.status,
                    FeatureStatus::Installed | FeatureStatus::Installing
                )
        }) {
            return Ok(None);
        }

        let moved_from = current.filter(|m| m.interface != member.interface);
        let before_old = moved_from
            .as_ref()
            .and_then(|m| device.dhcp_routers(&m.interface));
        let before_new = device.dhcp_routers(&member.interface);

        let mut state = FeatureState::default();
        state.begin(FeatureStatus::Installing, now);
        device.vrrp.insert(
            group.id.clone(),
            VrrpMembership {
                interface: member.interface.clone(),
                virtual_ip: group.virtual_ip.clone(),
                virtual_router_id: group.virtual_router_id,
                params: params.clone(),
                state,
            },
        );

        let mut tasks = Vec::new();
        if let Some(old) = &moved_from {
            tasks.push(leave_task(old));
            let after_old = device.dhcp_routers(&old.interface);
            if before_old != after_old {
                tasks.extend(dhcp::reissue(
                    device,
                    &old.interface,
                    before_old.as_deref(),
                    after_old.as_deref(),
                ));
            }
        }
        tasks.push(Task::agent(messages::ADD_VRRP_GROUP, params));
        let after_new = device.dhcp_routers(&member.interface);
        if before_new != after_new {
            tasks.extend(dhcp::reissue(
                device,
                &member.interface,
                before_new.as_deref(),
                after_new.as_deref(),
            ));
        }

        let role = if was_member { Role::Stay } else { Role::Join };
        Ok(Some(Plan {
            title: format!("Install VRRP group {}", group.name),
            tasks,
            data: json!(VrrpJobData {
                request_time: now,
                group: group.id.clone(),
                role,
                previous: None,
            }),
            options: None,
        }))
    }

    fn plan_leave(&self, device: &mut Device, now: DateTime<Utc>) -> Option<Plan> {
        let membership = device.vrrp.get(&self.group_id)?.clone();
        let old_routers = device.dhcp_routers(&membership.interface);

        let entry = device.vrrp.get_mut(&self.group_id)?;
        let previous = entry.state.clone();
        entry.state.begin(FeatureStatus::Uninstalling, now);

        let new_routers = device.dhcp_routers(&membership.interface);
        let mut tasks = vec![leave_task(&membership)];
        if old_routers != new_routers {
            tasks.extend(dhcp::reissue(
                device,
                &membership.interface,
                old_routers.as_deref(),
                new_routers.as_deref(),
            ));
        }

        Some(Plan {
            title: format!("Uninstall VRRP group {}", self.group_id),
            tasks,
            data: json!(VrrpJobData {
                request_time: now,
                group: self.group_id.clone(),
                role: Role::Leave,
                previous: Some(previous),
            }),
            options: None,
        })
    }
}

impl DevicePlanner for VrrpPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let was_member = device
            .vrrp
            .get(&self.group_id)
            .is_some_and(|m| !m.state.status.pending_removal());
        let member = self
            .group
            .as_ref()
            .and_then(|g| g.member(&device.id).map(|m| (g, m.clone())));

        match (member, was_member) {
            (Some((group, member)), _) => self.plan_member(device, group, &member, was_member, now),
            (None, true) => Ok(self.plan_leave(device, now)),
            (None, false) => Ok(None),
        }
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<VrrpJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct VrrpModule {
    ctx: Arc<FeatureContext>,
}

impl VrrpModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<VrrpJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for VrrpModule {
    fn method(&self) -> Feature {
        Feature::Vrrp
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: VrrpRequest = request_data(self.method(), &request.data)?;
        let group = match body.action {
            Action::Install => Some(
                self.ctx
                    .store
                    .vrrp_group(&body.group)
                    .await?
                    .ok_or_else(|| CoreError::policy_not_found("VRRP group", &body.group))?,
            ),
            Action::Uninstall => None,
        };

        // Affected: what the caller named, current members, new members.
        let mut devices = request.devices.clone();
        for device in self.ctx.store.devices().await? {
            if device.vrrp.contains_key(&body.group) {
                devices.push(device.id);
            }
        }
        if let Some(group) = &group {
            devices.extend(group.members.iter().map(|m| m.device.clone()));
        }

        let planner = VrrpPlanner {
            group_id: body.group,
            group,
        };
        let request = ApplyRequest {
            devices,
            ..request.clone()
        };
        self.ctx.submit(self.method(), &request, &planner).await
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
        if !compat::supports(Feature::Vrrp, &version) {
            return Ok(SyncContribution::default());
        }
        let groups = self.ctx.store.vrrp_groups(&device.org).await?;
        let mut synced = EntriesSynced::default();
        let mut requests = Vec::new();
        for (id, membership) in &device.vrrp {
            if membership.state.status.pending_removal() {
                synced.removed.push(id.clone());
                continue;
            }
            let group = groups.iter().find(|g| &g.id == id);
            match group.and_then(|g| g.member(&device.id).map(|m| (g, m))) {
                Some((group, member)) => {
                    requests.push(Task::agent(
                        messages::ADD_VRRP_GROUP,
                        transform_vrrp(group, member, &version),
                    ));
                    synced.installed.push(id.clone());
                }
                None => warn!(device = %device.id, group = %id, "VRRP membership without group document"),
            }
        }
        Ok(SyncContribution {
            requests,
            complete_data: json!(synced),
            call_complete: !device.vrrp.is_empty(),
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        let Ok(synced) = serde_json::from_value::<EntriesSynced>(data.clone()) else {
            warn!(device = %device, "unreadable VRRP sync data");
            return;
        };
        self.ctx
            .settle_device(self.method(), device, None, "sync confirmation", |dev| {
                let before = dev.vrrp.len();
                dev.vrrp.retain(|id, m| {
                    !(synced.removed.contains(id) && m.state.not_newer_than(sync_time))
                });
                let mut changed = dev.vrrp.len() != before;
                for (id, membership) in &mut dev.vrrp {
                    if synced.installed.contains(id)
                        && membership.state.not_newer_than(sync_time)
                        && membership.state.status != FeatureStatus::Installed
                    {
                        membership.state.status = FeatureStatus::Installed;
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
    use crate::model::{DhcpConfig, DhcpEntry, Interface};

    fn device(id: &str) -> Device {
        let mut dev = Device::new(id, "o1");
        dev.versions.agent = Some("6.2.0".into());
        dev.interfaces = vec![Interface {
            dev_id: "L".into(),
            name: "lan".into(),
            assigned: true,
            kind: InterfaceKind::Lan,
            ip: Some("192.168.1.2/24".into()),
            gateway: None,
            metric: None,
            routing: Vec::new(),
            qos_policy: None,
        }];
        let mut state = FeatureState::default();
        state.status = FeatureStatus::Installed;
        dev.dhcp.push(DhcpEntry {
            config: DhcpConfig {
                id: "dh1".into(),
                interface: "L".into(),
                range_start: "192.168.1.10".into(),
                range_end: "192.168.1.50".into(),
                dns: Vec::new(),
                mac_assign: Vec::new(),
                options: Vec::new(),
            },
            state,
        });
        dev
    }

    fn group(members: &[&str]) -> VrrpGroup {
        VrrpGroup {
            id: "G1".into(),
            org: "o1".into(),
            name: "edge".into(),
            virtual_router_id: 7,
            virtual_ip: "192.168.1.1".into(),
            preemption: true,
            accept_mode: false,
            members: members
                .iter()
                .map(|d| VrrpMember {
                    device: (*d).into(),
                    interface: "L".into(),
                    priority: 100,
                    track_interfaces_mandatory: Vec::new(),
                    track_interfaces_optional: Vec::new(),
                })
                .collect(),
        }
    }

    fn names(plan: &Plan) -> Vec<&str> {
        plan.tasks.iter().map(|t| t.message.as_str()).collect()
    }

    #[test]
    fn joining_member_reissues_dhcp_with_virtual_ip() {
        let mut dev = device("d1");
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        let plan = planner.plan(&mut dev, Utc::now()).unwrap().unwrap();
        assert_eq!(
            names(&plan),
            vec![
                messages::ADD_VRRP_GROUP,
                messages::REMOVE_DHCP_CONFIG,
                messages::ADD_DHCP_CONFIG
            ]
        );
        assert_eq!(plan.tasks[1].params["routers"], "192.168.1.2");
        assert_eq!(plan.tasks[2].params["routers"], "192.168.1.1");
        assert_eq!(plan.data["role"], "join");
    }

    #[test]
    fn leaving_member_gets_its_own_address_back() {
        let mut dev = device("d2");
        let join = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d2"])),
        };
        let now = Utc::now();
        join.plan(&mut dev, now).unwrap();
        dev.vrrp.get_mut(&PolicyId::from("G1")).unwrap().state.status = FeatureStatus::Installed;

        let leave = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        let plan = leave
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            names(&plan),
            vec![
                messages::REMOVE_VRRP_GROUP,
                messages::REMOVE_DHCP_CONFIG,
                messages::ADD_DHCP_CONFIG
            ]
        );
        assert_eq!(plan.tasks[1].params["routers"], "192.168.1.1");
        assert_eq!(plan.tasks[2].params["routers"], "192.168.1.2");

        let data: VrrpJobData = serde_json::from_value(plan.data).unwrap();
        assert!(data.settle(&mut dev, Outcome::Completed));
        assert!(dev.vrrp.is_empty());
    }

    #[test]
    fn staying_member_only_resends_group() {
        let mut dev = device("d1");
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1", "d3"])),
        };
        let now = Utc::now();
        planner.plan(&mut dev, now).unwrap();
        dev.vrrp.get_mut(&PolicyId::from("G1")).unwrap().state.status = FeatureStatus::Installed;

        let mut reprioritised = group(&["d1", "d3"]);
        reprioritised.members[0].priority = 120;
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(reprioritised),
        };
        let plan = planner
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap()
            .unwrap();
        assert_eq!(names(&plan), vec![messages::ADD_VRRP_GROUP]);
        assert_eq!(plan.tasks[0].params["priority"], 120);
        assert_eq!(plan.data["role"], "stay");
    }

    #[test]
    fn unchanged_group_is_not_resent() {
        let mut dev = device("d1");
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        let now = Utc::now();
        planner.plan(&mut dev, now).unwrap().unwrap();
        dev.vrrp.get_mut(&PolicyId::from("G1")).unwrap().state.status = FeatureStatus::Installed;

        let again = planner
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap();
        assert!(again.is_none());
        assert_eq!(
            dev.vrrp[&PolicyId::from("G1")].state.request_time,
            Some(now)
        );
    }

    #[test]
    fn moving_member_leaves_the_old_interface() {
        let mut dev = device("d1");
        dev.interfaces.push(Interface {
            dev_id: "L2".into(),
            name: "lan2".into(),
            assigned: true,
            kind: InterfaceKind::Lan,
            ip: Some("192.168.1.3/24".into()),
            gateway: None,
            metric: None,
            routing: Vec::new(),
            qos_policy: None,
        });
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        let now = Utc::now();
        planner.plan(&mut dev, now).unwrap().unwrap();
        dev.vrrp.get_mut(&PolicyId::from("G1")).unwrap().state.status = FeatureStatus::Installed;

        let mut moved = group(&["d1"]);
        moved.members[0].interface = "L2".into();
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(moved),
        };
        let plan = planner
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            names(&plan),
            vec![
                messages::REMOVE_VRRP_GROUP,
                messages::REMOVE_DHCP_CONFIG,
                messages::ADD_DHCP_CONFIG,
                messages::ADD_VRRP_GROUP
            ]
        );
        assert_eq!(plan.tasks[0].params["devId"], "L");
        assert_eq!(plan.tasks[1].params["routers"], "192.168.1.1");
        assert_eq!(plan.tasks[2].params["routers"], "192.168.1.2");
        assert_eq!(dev.vrrp[&PolicyId::from("G1")].interface, "L2");
    }

    #[test]
    fn deleted_leave_lets_the_pending_join_finish() {
        let mut dev = device("d1");
        let now = Utc::now();
        let join = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        let join_plan = join.plan(&mut dev, now).unwrap().unwrap();
        let leave = VrrpPlanner {
            group_id: "G1".into(),
            group: None,
        };
        let leave_plan = leave
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap()
            .unwrap();

        let leaving: VrrpJobData = serde_json::from_value(leave_plan.data).unwrap();
        assert!(leaving.settle(&mut dev, Outcome::Removed));
        let joining: VrrpJobData = serde_json::from_value(join_plan.data).unwrap();
        assert!(joining.settle(&mut dev, Outcome::Completed));
        assert_eq!(
            dev.vrrp[&PolicyId::from("G1")].state.status,
            FeatureStatus::Installed
        );
    }

    #[test]
    fn old_agents_cannot_join() {
        let mut dev = device("d1");
        dev.versions.agent = Some("6.0.4".into());
        let planner = VrrpPlanner {
            group_id: "G1".into(),
            group: Some(group(&["d1"])),
        };
        assert!(matches!(
            planner.plan(&mut dev, Utc::now()),
            Err(CoreError::Unsupported { .. })
        ));
    }
}
