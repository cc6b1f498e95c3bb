// ── Fleet snapshot ──
//
// Serializable image of the in-memory store and queue. The CLI keeps
// its fleet between invocations as one JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{Device, PolicyDocument};
use crate::queue::{MemoryJobQueue, QueueSnapshot};
use crate::store::MemoryStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub policies: Vec<PolicyDocument>,
    #[serde(default)]
    pub queue: QueueSnapshot,
}

impl FleetSnapshot {
    pub fn capture(store: &MemoryStore, queue: &MemoryJobQueue) -> Self {
        Self {
            devices: store.all_devices(),
            policies: store.policies(),
            queue: queue.snapshot(),
        }
    }

    /// Rebuild a store and queue holding this snapshot's contents.
    pub fn restore(self) -> (MemoryStore, MemoryJobQueue) {
        let store = MemoryStore::new();
        for device in self.devices {
            store.insert_device(device);
        }
        for doc in self.policies {
            store.put_policy(doc);
        }
        (store, MemoryJobQueue::from_snapshot(self.queue))
    }

    /// Read a snapshot file. A missing file is an empty fleet.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(CoreError::Internal(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::Internal(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("serialize snapshot: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| CoreError::Internal(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TrafficMap;
    use crate::store::Store;

    #[tokio::test]
    async fn restore_keeps_devices_policies_and_revisions() {
        let store = MemoryStore::new();
        let mut dev = Device::new("d1", "o1");
        dev.revision = 4;
        store.insert_device(dev);
        store.put_policy(PolicyDocument::TrafficMap(TrafficMap {
            org: "o1".into(),
            revision: 2,
            classes: Vec::new(),
        }));
        let queue = MemoryJobQueue::new();

        let json = serde_json::to_string(&FleetSnapshot::capture(&store, &queue)).unwrap();
        let (store, _queue) = serde_json::from_str::<FleetSnapshot>(&json)
            .unwrap()
            .restore();

        let dev = store.device(&"d1".into()).await.unwrap().unwrap();
        assert_eq!(dev.revision, 4);
        assert_eq!(
            store.traffic_map(&"o1".into()).await.unwrap().unwrap().revision,
            2
        );
    }

    #[test]
    fn missing_file_is_an_empty_fleet() {
        let snapshot = FleetSnapshot::load(Path::new("/nonexistent/edgesync/fleet.json")).unwrap();
        assert!(snapshot.devices.is_empty());
    }
}
