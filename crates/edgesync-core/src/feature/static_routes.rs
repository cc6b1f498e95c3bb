// ── Static routes ──

use std::net::IpAddr;
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
use crate::compat::{messages, transform_static_route};
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, Feature, FeatureState, FeatureStatus, Job, PolicyId, StaticRoute,
    StaticRouteEntry, Task,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RouteAction {
    Add,
    Remove,
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    action: RouteAction,
    #[serde(default)]
    route: Option<StaticRoute>,
    #[serde(default)]
    id: Option<PolicyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteJobData {
    request_time: DateTime<Utc>,
    action: RouteAction,
    id: PolicyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous: Option<FeatureState>,
}

impl RouteJobData {
    fn settle(&self, device: &mut Device, outcome: Outcome) -> bool {
        let Some(idx) = device
            .static_routes
            .iter()
            .position(|e| e.route.id == self.id)
        else {
            return false;
        };
        if !device.static_routes[idx].state.is_current(self.request_time) {
            return false;
        }
        if self.action == RouteAction::Remove && outcome == Outcome::Completed {
            device.static_routes.remove(idx);
            return true;
        }
        let state = &mut device.static_routes[idx].state;
        match (self.action, outcome) {
            (RouteAction::Remove, Outcome::Failed) => state.status = FeatureStatus::UninstallFailed,
            (RouteAction::Remove, _) => state.restore(self.previous.as_ref()),
            (RouteAction::Add, _) => state.status = outcome.status(true),
        }
        true
    }
}

/// `destination` must be a CIDR prefix and `gateway` a plain address.
fn validate(route: &StaticRoute) -> Result<(), CoreError> {
    let (addr, prefix) = route
        .destination
        .split_once('/')
        .ok_or_else(|| CoreError::validation(format!("{} is not a CIDR prefix", route.destination)))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid destination {}", route.destination)))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    match prefix.parse::<u8>() {
        Ok(len) if len <= max => {}
        _ => {
            return Err(CoreError::validation(format!(
                "invalid prefix length in {}",
                route.destination
            )));
        }
    }
    route
        .gateway
        .parse::<IpAddr>()
        .map_err(|_| CoreError::validation(format!("invalid gateway {}", route.gateway)))?;
    Ok(())
}

struct RoutePlanner {
    action: RouteAction,
    id: PolicyId,
    route: Option<StaticRoute>,
}

impl RoutePlanner {
    fn plan_add(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let route = self
            .route
            .as_ref()
            .ok_or_else(|| CoreError::validation("missing route"))?;
        validate(route)?;
        if let Some(dev_id) = &route.interface {
            if device.interface(dev_id).is_none() {
                return Err(CoreError::validation(format!("unknown interface {dev_id}")));
            }
        }

        match device.static_route(&route.id) {
            Some(entry) if entry.route != *route => {
                return Err(CoreError::validation(format!(
                    "route {} already exists",
                    route.id
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
            None => device.static_routes.push(StaticRouteEntry {
                route: route.clone(),
                state: FeatureState::default(),
            }),
        }

        let task = Task::agent(
            messages::ADD_ROUTE,
            transform_static_route(route, &device.agent_version()),
        );
        if let Some(entry) = device.static_route_mut(&route.id) {
            entry.state.begin(FeatureStatus::Installing, now);
        }
        Ok(Some(Plan {
            title: format!("Add route {} via {}", route.destination, route.gateway),
            tasks: vec![task],
            data: json!(RouteJobData {
                request_time: now,
                action: RouteAction::Add,
                id: route.id.clone(),
                previous: None,
            }),
            options: None,
        }))
    }

    fn plan_remove(
        &self,
        device: &mut Device,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, CoreError> {
        let version = device.agent_version();
        let entry = device
            .static_route_mut(&self.id)
            .ok_or_else(|| CoreError::validation(format!("unknown route {}", self.id)))?;
        if entry.state.status == FeatureStatus::Uninstalling {
            return Ok(None);
        }
        let previous = entry.state.clone();
        entry.state.begin(FeatureStatus::Uninstalling, now);
        Ok(Some(Plan {
            title: format!("Remove route {}", entry.route.destination),
            tasks: vec![Task::agent(
                messages::REMOVE_ROUTE,
                transform_static_route(&entry.route, &version),
            )],
            data: json!(RouteJobData {
                request_time: now,
                action: RouteAction::Remove,
                id: self.id.clone(),
                previous: Some(previous),
            }),
            options: None,
        }))
    }
}

impl DevicePlanner for RoutePlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        match self.action {
            RouteAction::Add => self.plan_add(device, now),
            RouteAction::Remove => self.plan_remove(device, now),
        }
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        if let Ok(data) = serde_json::from_value::<RouteJobData>(data.clone()) {
            data.settle(device, Outcome::NotQueued);
        }
    }
}

pub struct StaticRoutesModule {
    ctx: Arc<FeatureContext>,
}

impl StaticRoutesModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) {
        let Some(data) = self.ctx.job_data::<RouteJobData>(self.method(), job) else {
            return;
        };
        self.ctx
            .settle(self.method(), job, "job outcome", |dev| data.settle(dev, outcome))
            .await;
    }
}

#[async_trait]
impl FeatureModule for StaticRoutesModule {
    fn method(&self) -> Feature {
        Feature::StaticRoutes
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: RouteRequest = request_data(self.method(), &request.data)?;
        let id = body
            .id
            .clone()
            .or_else(|| body.route.as_ref().map(|r| r.id.clone()))
            .ok_or_else(|| CoreError::validation("missing route id"))?;
        let planner = RoutePlanner {
            action: body.action,
            id,
            route: body.route,
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
        let mut synced = EntriesSynced::default();
        let mut requests = Vec::new();
        for entry in &device.static_routes {
            if entry.state.status.pending_removal() {
                synced.removed.push(entry.route.id.clone());
            } else {
                requests.push(Task::agent(
                    messages::ADD_ROUTE,
                    transform_static_route(&entry.route, &version),
                ));
                synced.installed.push(entry.route.id.clone());
            }
        }
        Ok(SyncContribution {
            requests,
            complete_data: json!(synced),
            call_complete: !device.static_routes.is_empty(),
        })
    }

    async fn complete_sync(&self, device: &DeviceId, data: &Value, sync_time: DateTime<Utc>) {
        let Ok(synced) = serde_json::from_value::<EntriesSynced>(data.clone()) else {
            warn!(device = %device, "unreadable static route sync data");
            return;
        };
        self.ctx
            .settle_device(self.method(), device, None, "sync confirmation", |dev| {
                let before = dev.static_routes.len();
                dev.static_routes.retain(|e| {
                    !(synced.removed.contains(&e.route.id) && e.state.not_newer_than(sync_time))
                });
                let mut changed = dev.static_routes.len() != before;
                for entry in &mut dev.static_routes {
                    if synced.installed.contains(&entry.route.id)
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

    fn route(destination: &str, gateway: &str) -> StaticRoute {
        StaticRoute {
            id: "r1".into(),
            destination: destination.into(),
            gateway: gateway.into(),
            interface: None,
            metric: Some(10),
            redistribute_via_ospf: false,
            redistribute_via_bgp: false,
            on_link: false,
        }
    }

    #[test]
    fn validation_rejects_bad_addresses() {
        assert!(validate(&route("10.1.0.0/16", "10.0.0.1")).is_ok());
        assert!(validate(&route("10.1.0.0", "10.0.0.1")).is_err());
        assert!(validate(&route("10.1.0.0/33", "10.0.0.1")).is_err());
        assert!(validate(&route("10.1.0.0/16", "gateway")).is_err());
        assert!(validate(&route("2001:db8::/48", "2001:db8::1")).is_ok());
    }

    #[test]
    fn failed_remove_keeps_route_pending_removal() {
        let mut dev = Device::new("d1", "o1");
        let now = Utc::now();
        let add = RoutePlanner {
            action: RouteAction::Add,
            id: "r1".into(),
            route: Some(route("10.1.0.0/16", "10.0.0.1")),
        };
        add.plan(&mut dev, now).unwrap().unwrap();
        dev.static_routes[0].state.status = FeatureStatus::Installed;

        let remove = RoutePlanner {
            action: RouteAction::Remove,
            id: "r1".into(),
            route: None,
        };
        let later = now + chrono::Duration::seconds(1);
        let plan = remove.plan(&mut dev, later).unwrap().unwrap();
        let data: RouteJobData = serde_json::from_value(plan.data).unwrap();
        assert!(data.settle(&mut dev, Outcome::Failed));
        assert_eq!(
            dev.static_routes[0].state.status,
            FeatureStatus::UninstallFailed
        );

        // A queue refusal puts the route back where it was.
        let retry = remove.plan(&mut dev, later + chrono::Duration::seconds(1)).unwrap().unwrap();
        remove.revert(&mut dev, &retry.data);
        assert_eq!(
            dev.static_routes[0].state.status,
            FeatureStatus::UninstallFailed
        );
    }

    #[test]
    fn deleted_remove_lets_the_pending_add_finish() {
        let mut dev = Device::new("d1", "o1");
        let now = Utc::now();
        let add = RoutePlanner {
            action: RouteAction::Add,
            id: "r1".into(),
            route: Some(route("10.1.0.0/16", "10.0.0.1")),
        };
        let add_plan = add.plan(&mut dev, now).unwrap().unwrap();

        let remove = RoutePlanner {
            action: RouteAction::Remove,
            id: "r1".into(),
            route: None,
        };
        let remove_plan = remove
            .plan(&mut dev, now + chrono::Duration::seconds(1))
            .unwrap()
            .unwrap();
        let removal: RouteJobData = serde_json::from_value(remove_plan.data).unwrap();
        assert!(removal.settle(&mut dev, Outcome::Removed));
        assert_eq!(dev.static_routes[0].state.status, FeatureStatus::Installing);
        assert_eq!(dev.static_routes[0].state.request_time, Some(now));

        let addition: RouteJobData = serde_json::from_value(add_plan.data).unwrap();
        assert!(addition.settle(&mut dev, Outcome::Completed));
        assert_eq!(dev.static_routes[0].state.status, FeatureStatus::Installed);
    }
}
