// ── In-memory store ──
//
// DashMap-backed reference implementation of `Store`. Used by tests
// and by the CLI, which round-trips it through a snapshot file.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Store, StoreError};
use crate::model::{
    AppIdentification, Device, DeviceId, FirewallPolicy, NotificationsConfig, OrgId, PolicyDocument,
    PolicyId, QosPolicy, TrafficMap, VrrpGroup,
};

#[derive(Default)]
pub struct MemoryStore {
    devices: DashMap<DeviceId, Device>,
    qos_policies: DashMap<PolicyId, QosPolicy>,
    traffic_maps: DashMap<OrgId, TrafficMap>,
    app_identifications: DashMap<OrgId, AppIdentification>,
    firewall_policies: DashMap<PolicyId, FirewallPolicy>,
    vrrp_groups: DashMap<PolicyId, VrrpGroup>,
    notifications: DashMap<OrgId, NotificationsConfig>,
    /// When set, every call fails with a backend error.
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::Release);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Backend("store unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Insert or replace a policy document.
    pub fn put_policy(&self, doc: PolicyDocument) {
        match doc {
            PolicyDocument::QosPolicy(p) => {
                self.qos_policies.insert(p.id.clone(), p);
            }
            PolicyDocument::TrafficMap(m) => {
                self.traffic_maps.insert(m.org.clone(), m);
            }
            PolicyDocument::AppIdentification(a) => {
                self.app_identifications.insert(a.org.clone(), a);
            }
            PolicyDocument::FirewallPolicy(f) => {
                self.firewall_policies.insert(f.id.clone(), f);
            }
            PolicyDocument::VrrpGroup(g) => {
                self.vrrp_groups.insert(g.id.clone(), g);
            }
            PolicyDocument::Notifications(n) => {
                self.notifications.insert(n.org.clone(), n);
            }
        }
    }

    /// All policy documents, in a stable order.
    pub fn policies(&self) -> Vec<PolicyDocument> {
        let mut docs: Vec<PolicyDocument> = Vec::new();
        docs.extend(
            self.qos_policies
                .iter()
                .map(|r| PolicyDocument::QosPolicy(r.value().clone())),
        );
        docs.extend(
            self.traffic_maps
                .iter()
                .map(|r| PolicyDocument::TrafficMap(r.value().clone())),
        );
        docs.extend(
            self.app_identifications
                .iter()
                .map(|r| PolicyDocument::AppIdentification(r.value().clone())),
        );
        docs.extend(
            self.firewall_policies
                .iter()
                .map(|r| PolicyDocument::FirewallPolicy(r.value().clone())),
        );
        docs.extend(
            self.vrrp_groups
                .iter()
                .map(|r| PolicyDocument::VrrpGroup(r.value().clone())),
        );
        docs.extend(
            self.notifications
                .iter()
                .map(|r| PolicyDocument::Notifications(r.value().clone())),
        );
        docs.sort_by_key(|d| serde_json::to_string(d).unwrap_or_default());
        docs
    }

    /// Insert or replace a device without touching its revision.
    pub fn insert_device(&self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    /// Snapshot of every device, ordered by id.
    pub fn all_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|r| r.value().clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn device(&self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        self.check()?;
        Ok(self.devices.get(id).map(|r| r.value().clone()))
    }

    async fn devices(&self) -> Result<Vec<Device>, StoreError> {
        self.check()?;
        Ok(self.all_devices())
    }

    async fn put_device(&self, device: Device) -> Result<(), StoreError> {
        self.check()?;
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn save_device(&self, mut device: Device) -> Result<Device, StoreError> {
        self.check()?;
        let mut slot = self
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| StoreError::Missing(device.id.clone()))?;
        if slot.revision != device.revision {
            return Err(StoreError::Conflict {
                device: device.id.clone(),
                expected: device.revision,
                found: slot.revision,
            });
        }
        device.revision += 1;
        *slot = device.clone();
        Ok(device)
    }

    async fn qos_policy(&self, id: &PolicyId) -> Result<Option<QosPolicy>, StoreError> {
        self.check()?;
        Ok(self.qos_policies.get(id).map(|r| r.value().clone()))
    }

    async fn traffic_map(&self, org: &OrgId) -> Result<Option<TrafficMap>, StoreError> {
        self.check()?;
        Ok(self.traffic_maps.get(org).map(|r| r.value().clone()))
    }

    async fn app_identification(
        &self,
        org: &OrgId,
    ) -> Result<Option<AppIdentification>, StoreError> {
        self.check()?;
        Ok(self.app_identifications.get(org).map(|r| r.value().clone()))
    }

    async fn firewall_policy(&self, id: &PolicyId) -> Result<Option<FirewallPolicy>, StoreError> {
        self.check()?;
        Ok(self.firewall_policies.get(id).map(|r| r.value().clone()))
    }

    async fn vrrp_group(&self, id: &PolicyId) -> Result<Option<VrrpGroup>, StoreError> {
        self.check()?;
        Ok(self.vrrp_groups.get(id).map(|r| r.value().clone()))
    }

    async fn vrrp_groups(&self, org: &OrgId) -> Result<Vec<VrrpGroup>, StoreError> {
        self.check()?;
        let mut groups: Vec<VrrpGroup> = self
            .vrrp_groups
            .iter()
            .filter(|r| &r.value().org == org)
            .map(|r| r.value().clone())
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn notifications(
        &self,
        org: &OrgId,
    ) -> Result<Option<NotificationsConfig>, StoreError> {
        self.check()?;
        Ok(self.notifications.get(org).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::model::{Feature, FeatureStatus};
    use crate::store::update_device;

    #[tokio::test]
    async fn save_bumps_revision_and_detects_conflicts() {
        let store = MemoryStore::new();
        store.put_device(Device::new("d1", "o1")).await.unwrap();

        let dev = store.device(&"d1".into()).await.unwrap().unwrap();
        let stale = dev.clone();
        let saved = store.save_device(dev).await.unwrap();
        assert_eq!(saved.revision, 1);

        let err = store.save_device(stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_device_applies_mutation() {
        let store = MemoryStore::new();
        store.put_device(Device::new("d1", "o1")).await.unwrap();

        let out = update_device(&store, &"d1".into(), 3, |dev| {
            dev.state_mut(Feature::QosPolicy).status = FeatureStatus::Installing;
            Ok(Some(7))
        })
        .await
        .unwrap();
        let (saved, value) = out.unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            saved.state(Feature::QosPolicy).status,
            FeatureStatus::Installing
        );
    }

    #[tokio::test]
    async fn update_device_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = update_device(&store, &"ghost".into(), 3, |_| Ok(Some(())))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.devices().await.is_err());
        store.set_unavailable(false);
        assert!(store.devices().await.unwrap().is_empty());
    }
}
