// ── Persistent store boundary ──
//
// Devices are written with an optimistic revision check; policy
// documents are read-only from the engine's point of view.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{
    AppIdentification, Device, DeviceId, FirewallPolicy, NotificationsConfig, OrgId, PolicyId,
    QosPolicy, TrafficMap, VrrpGroup,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer saved the device first.
    #[error("Revision conflict on device {device}: expected {expected}, found {found}")]
    Conflict {
        device: DeviceId,
        expected: u64,
        found: u64,
    },

    #[error("Device {0} does not exist")]
    Missing(DeviceId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Devices ──────────────────────────────────────────────────────

    async fn device(&self, id: &DeviceId) -> Result<Option<Device>, StoreError>;

    async fn devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Insert or replace a device unconditionally (registration, import).
    async fn put_device(&self, device: Device) -> Result<(), StoreError>;

    /// Save `device` if the stored revision still equals `device.revision`.
    /// Returns the saved document with its revision bumped.
    async fn save_device(&self, device: Device) -> Result<Device, StoreError>;

    // ── Policy documents ─────────────────────────────────────────────

    async fn qos_policy(&self, id: &PolicyId) -> Result<Option<QosPolicy>, StoreError>;

    async fn traffic_map(&self, org: &OrgId) -> Result<Option<TrafficMap>, StoreError>;

    async fn app_identification(
        &self,
        org: &OrgId,
    ) -> Result<Option<AppIdentification>, StoreError>;

    async fn firewall_policy(&self, id: &PolicyId) -> Result<Option<FirewallPolicy>, StoreError>;

    async fn vrrp_group(&self, id: &PolicyId) -> Result<Option<VrrpGroup>, StoreError>;

    async fn vrrp_groups(&self, org: &OrgId) -> Result<Vec<VrrpGroup>, StoreError>;

    async fn notifications(&self, org: &OrgId)
    -> Result<Option<NotificationsConfig>, StoreError>;
}

/// Keyed read-modify-write of one device.
///
/// `mutate` runs against a fresh copy on every attempt and must be
/// deterministic in the document it receives. Returning `Ok(None)`
/// leaves the device untouched.
pub async fn update_device<T, F>(
    store: &dyn Store,
    id: &DeviceId,
    retry_limit: u32,
    mut mutate: F,
) -> Result<Option<(Device, T)>, CoreError>
where
    F: FnMut(&mut Device) -> Result<Option<T>, CoreError> + Send,
    T: Send,
{
    let mut attempt = 0;
    loop {
        let mut device = store
            .device(id)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound {
                device: id.to_string(),
            })?;

        let Some(out) = mutate(&mut device)? else {
            return Ok(None);
        };

        match store.save_device(device).await {
            Ok(saved) => return Ok(Some((saved, out))),
            Err(StoreError::Conflict { .. }) if attempt < retry_limit => {
                attempt += 1;
                debug!(device = %id, attempt, "revision conflict, retrying update");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
