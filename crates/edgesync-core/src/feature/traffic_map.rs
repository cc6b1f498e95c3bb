// ── QoS traffic map ──
//
// Org-wide service-class to queue mapping. QoS policies depend on it, so
// the QoS module installs it as a prerequisite when the device lacks the
// current revision.

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
use crate::compat::{self, messages, transform_traffic_map};
use crate::error::CoreError;
use crate::model::{Device, DeviceId, Feature, FeatureStatus, Job, OrgId, Task, TrafficMap};

/// Queue `add-qos-traffic-map` unless the current revision is already
/// installed or on its way.
pub(crate) fn install_prerequisite(
    device: &mut Device,
    map: Option<&TrafficMap>,
    now: DateTime<Utc>,
) -> Option<(Task, StateChange)> {
    let map = map?;
    let version = device.agent_version();
    let state = device.state_mut(Feature::QosTrafficMap);
    if state.targets(None, Some(map.revision)) {
        return None;
    }
    state.begin(FeatureStatus::Installing, now);
    state.revision = Some(map.revision);
    Some((
        Task::agent(
            messages::ADD_QOS_TRAFFIC_MAP,
            transform_traffic_map(map, &version),
        ),
        StateChange {
            feature: Feature::QosTrafficMap,
            install: true,
            request_time: now,
        },
    ))
}

#[derive(Debug, Deserialize)]
struct TrafficMapRequest {
    action: Action,
}

struct TrafficMapPlanner {
    action: Action,
    maps: BTreeMap<OrgId, TrafficMap>,
}

impl DevicePlanner for TrafficMapPlanner {
    fn plan(&self, device: &mut Device, now: DateTime<Utc>) -> Result<Option<Plan>, CoreError> {
        let (title, task, change) = match self.action {
            Action::Install => {
                compat::require(Feature::QosTrafficMap, device)?;
                let map = self
                    .maps
                    .get(&device.org)
                    .ok_or_else(|| CoreError::policy_not_found("Traffic map", &device.org))?;
                let Some((task, change)) = install_prerequisite(device, Some(map), now) else {
                    return Ok(None);
                };
                ("Install QoS traffic map", task, change)
            }
            Action::Uninstall => {
                if !device.effective_qos().is_empty() {
                    return Err(CoreError::validation(format!(
                        "traffic map on device {} is in use by QoS policies",
                        device.id
                    )));
                }
                let state = device.state_mut(Feature::QosTrafficMap);
                if matches!(
                    state.status,
                    FeatureStatus::None | FeatureStatus::Uninstalling
                ) {
                    return Ok(None);
                }
                state.begin(FeatureStatus::Uninstalling, now);
                (
                    "Uninstall QoS traffic map",
                    Task::agent(messages::REMOVE_QOS_TRAFFIC_MAP, json!({})),
                    StateChange {
                        feature: Feature::QosTrafficMap,
                        install: false,
                        request_time: now,
                    },
                )
            }
        };
        Ok(Some(Plan {
            title: title.into(),
            tasks: vec![task],
            data: json!(ChangeSet {
                request_time: now,
                changes: vec![change],
            }),
            options: None,
        }))
    }

    fn revert(&self, device: &mut Device, data: &Value) {
        revert_changes(device, data);
    }
}

pub struct TrafficMapModule {
    ctx: Arc<FeatureContext>,
}

impl TrafficMapModule {
    pub fn new(ctx: Arc<FeatureContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FeatureModule for TrafficMapModule {
    fn method(&self) -> Feature {
        Feature::QosTrafficMap
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, CoreError> {
        let body: TrafficMapRequest = request_data(self.method(), &request.data)?;
        let mut maps = BTreeMap::new();
        if body.action == Action::Install {
            for org in self.ctx.orgs_of(&request.devices).await? {
                if let Some(map) = self.ctx.store.traffic_map(&org).await? {
                    maps.insert(org, map);
                }
            }
        }
        let planner = TrafficMapPlanner {
            action: body.action,
            maps,
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
        let state = device.state(Feature::QosTrafficMap);
        let wanted = state.status.wants_installed() || !device.effective_qos().is_empty();
        let supported = compat::supports(Feature::QosTrafficMap, &device.agent_version());
        let map = if wanted && supported {
            self.ctx.store.traffic_map(&device.org).await?
        } else {
            None
        };

        Ok(match map {
            Some(map) => SyncContribution::new(
                vec![Task::agent(
                    messages::ADD_QOS_TRAFFIC_MAP,
                    transform_traffic_map(&map, &device.agent_version()),
                )],
                json!(Synced {
                    installed: true,
                    revision: Some(map.revision),
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
