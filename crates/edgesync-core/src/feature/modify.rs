// ── Device configuration modify ──
//
// Interface addressing, routing protocols and routing filters. The
// device document is updated up front; the original values travel in
// the job data so a failed or deleted job can put them back.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ApplyOutcome, ApplyRequest, DevicePlanner, FeatureContext, FeatureModule, Outcome, Plan,
    SyncContribution, Synced, dhcp, request_data,
};
use crate::compat::{
    messages, transform_interface, transform_routing_filter, transform_routing_filters,
};
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, Feature, FeatureStatus, Interface, InterfaceKind, Job, RoutingFilter, Task,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InterfaceChange {
    dev_id: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    metric: Option<u32>,
    #[serde(default)]
    routing: Option<Vec<String>>,
}

impl InterfaceChange {
    fn apply_to(&self, ifc: &mut Interface) {
        if let Some(ip) = &self.ip {
            ifc.ip = Some(ip.clone());
        }
        if let Some(gateway) = &self.gateway {
            ifc.gateway = Some(gateway.clone());
        }
        if let Some(metric) = self.metric {
            ifc.metric = Some(metric);
        }
        if let Some(routing) = &self.routing {
            ifc.routing.clone_from(routing);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    #[serde(default)]
    interfaces: Vec<InterfaceChange>,
    #[serde(default)]
    routing_filters: Option<Vec<RoutingFilter>>,
}

/// Values a failed modify puts back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rollback {
    interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    routing_filters: Option<Vec<RoutingFilter>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyJobData {
    request_time: DateTime<Utc>,
    rollback: Rollback,
}

impl ModifyJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        if !device.state(Feature::Modify).is_current(self.request_time) {
            return false;
        }
        if outcome != Outcome::Completed {
            for original in &self.rollback.interfaces {
                if let Some(ifc) = device.interface_mut(&original.dev_id) {
                    ifc.ip.clone_from(&original.ip);
                    ifc.gateway.clone_from(&original.gateway);
                    ifc.metric = original.metric;
                    ifc.routing.clone_from(&original.routing);
                }
            }
            if let Some(filters) = &self.rollback.routing_filters {
                device.routing_filters.clone_from(filters);
            }
        }
        device.state_mut(Feature::Modify).status = outcome.status(true);
        true
    }
}

fn validate_address(ip: &str) -> Result<(), CoreError> {
    let addr = ip.split_once('/').map_or(ip, |(addr, _)| addr);
    addr.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| CoreError::validation(format!("invalid address {ip}")))
}

struct ModifyPlanner {
    interfaces: Vec<InterfaceChange>,
    routing_filters: Option<Vec<RoutingFilter>>,
}

impl ModifyPlanner {
    fn filter_tasks(&self, device: &Device, rollback: &mut Rollback) -> Vec<Task> {
        let Some(wanted) = &self.routing_filters else {
            return Vec::new();
        };
        let current = &device.routing_filters;
        let removed: Vec<&RoutingFilter> = current
            .iter()
            .filter(|f| !wanted.contains(f))
            .collect();
        let added: Vec<&RoutingFilter> = wanted.iter().filter(|f| !current.contains(f)).collect();
        if removed.is_empty() && added.is_empty() {
            return Vec::new();
        }

        let version = device.agent_version();
        rollback.routing_filters = Some(current.clone());
        removed
            .into_iter()
            .map(|f| Task::agent(messages::REMOVE_ROUTING_FILTER, json!({ "name": f.name })))
            .chain(added.into_iter().map(|f| {
                Task::agent(
                    messages::ADD_ROUTING_FILTER,
                    transform_routing_filter(f, &version),
                )
            }))
            .collect()
    }
}

impl DevicePlanner for ModifyPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let version = device.agent_version();
        let mut rollback = Rollback::default();
        let mut tasks = Vec::new();
        let mut readdressed = Vec::new();

        for change in &self.interfaces {
            if let Some(ip) = &change.ip {
                validate_address(ip)?;
            }
            let ifc = device
                .interface_mut(&change.dev_id)
                .ok_or_else(|| CoreError::validation(format!("unknown interface {}", change.dev_id)))?;
            let original = ifc.clone();
            change.apply_to(ifc);
            if *ifc == original {
                continue;
            }
            tasks.push(Task::agent(
                messages::MODIFY_INTERFACE,
                transform_interface(ifc, &version),
            ));
            if ifc.kind == InterfaceKind::Lan && ifc.ip != original.ip {
                readdressed.push((original.clone(), ifc.address().map(str::to_owned)));
            }
            rollback.interfaces.push(original);
        }

        tasks.extend(self.filter_tasks(device, &mut rollback));
        if let Some(filters) = &self.routing_filters {
            device.routing_filters.clone_from(filters);
        }

        // Clients behind an active VRRP group keep the virtual address.
        for (original, new_address) in readdressed {
            let behind_vrrp = device
                .vrrp
                .values()
                .any(|m| m.interface == original.dev_id && m.is_active());
            if !behind_vrrp {
                tasks.extend(dhcp::reissue(
                    device,
                    &original.dev_id,
                    original.address(),
                    new_address.as_deref(),
                ));
            }
        }

        if tasks.is_empty() {
            return Ok(None);
        }
        device
            .state_mut(Feature::Modify)
            .begin(FeatureStatus::Installing, now);

        Ok(Some(Plan {
            title: "Modify device".into(),
            tasks,
            data: json!(ModifyJobData {
                request_time: now,
                rollback,
            }),
            options: None,
        }))
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<ModifyJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct ModifyModule {
    ctx: Arc<FeatureContext>,
}

impl ModifyModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<ModifyJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for ModifyModule {
    fn method(&self) -> Feature {
        Feature::Modify
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: ModifyRequest = request_data(self.method(), &request.data)?;
        if body.interfaces.is_empty() && body.routing_filters.is_none() {
            return Err(CoreError::validation("nothing to modify"));
        }
        let planner = ModifyPlanner {
            interfaces: body.interfaces,
            routing_filters: body.routing_filters,
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
        let requests = device
            .interfaces
            .iter()
            .filter(|i| i.assigned)
            .map(|i| Task::agent(messages::MODIFY_INTERFACE, transform_interface(i, &version)))
            .chain(
                transform_routing_filters(&device.routing_filters, &version)
                    .into_iter()
                    .map(|params| Task::agent(messages::ADD_ROUTING_FILTER, params)),
            )
            .collect();
        Ok(SyncContribution {
            requests,
            complete_data: json!(Synced {
                installed: true,
                revision: None,
            }),
            call_complete: device.state(Feature::Modify).status != FeatureStatus::None,
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        self.ctx
            .settle_synced_singleton(self.method(), device, data, sync_time)
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DhcpConfig, DhcpEntry, FeatureState, FilterAction};

    fn device() -> Device {
        let mut dev = Device::new("d1", "o1");
        dev.versions.agent = Some("6.2.0".into());
        dev.interfaces = vec![Interface {
            dev_id: "L".into(),
            name: "lan".into(),
            assigned: true,
            kind: InterfaceKind::Lan,
            ip: Some("192.168.1.1/24".into()),
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

    fn readdress(ip: &str) -> ModifyPlanner {
        ModifyPlanner {
            interfaces: vec![InterfaceChange {
                dev_id: "L".into(),
                ip: Some(ip.into()),
                gateway: None,
                metric: None,
                routing: None,
            }],
            routing_filters: None,
        }
    }

    #[test]
    fn lan_readdress_reissues_dhcp() {
        let mut dev = device();
        let plan = readdress("192.168.5.1/24")
            .plan(&mut dev, Utc::now())
            .unwrap()
            .unwrap();
        let names: Vec<_> = plan.tasks.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(
            names,
            vec![
                messages::MODIFY_INTERFACE,
                messages::REMOVE_DHCP_CONFIG,
                messages::ADD_DHCP_CONFIG
            ]
        );
        assert_eq!(plan.tasks[1].params["routers"], "192.168.1.1");
        assert_eq!(plan.tasks[2].params["routers"], "192.168.5.1");
    }

    #[test]
    fn unchanged_interfaces_queue_nothing() {
        let mut dev = device();
        assert!(
            readdress("192.168.1.1/24")
                .plan(&mut dev, Utc::now())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn failure_restores_original_addressing() {
        let mut dev = device();
        let plan = readdress("192.168.5.1/24")
            .plan(&mut dev, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(dev.interfaces[0].ip.as_deref(), Some("192.168.5.1/24"));

        let data: ModifyJobData = serde_json::from_value(plan.data).unwrap();
        assert!(data.settle(&mut dev, Outcome::Failed));
        assert_eq!(dev.interfaces[0].ip.as_deref(), Some("192.168.1.1/24"));
        assert_eq!(
            dev.state(Feature::Modify).status,
            FeatureStatus::InstallFailed
        );
    }

    #[test]
    fn changed_filter_is_removed_then_added() {
        let mut dev = device();
        let filter = |default_action| RoutingFilter {
            name: "f1".into(),
            description: String::new(),
            default_action,
            rules: Vec::new(),
        };
        dev.routing_filters = vec![filter(FilterAction::Allow)];
        let planner = ModifyPlanner {
            interfaces: Vec::new(),
            routing_filters: Some(vec![filter(FilterAction::Deny)]),
        };
        let plan = planner.plan(&mut dev, Utc::now()).unwrap().unwrap();
        let names: Vec<_> = plan.tasks.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(
            names,
            vec![messages::REMOVE_ROUTING_FILTER, messages::ADD_ROUTING_FILTER]
        );
        assert_eq!(dev.routing_filters[0].default_action, FilterAction::Deny);
    }

    #[test]
    fn bad_address_is_rejected() {
        let mut dev = device();
        assert!(matches!(
            readdress("not-an-ip").plan(&mut dev, Utc::now()),
            Err(CoreError::ValidationFailed { .. })
        ));
    }
}
