// ── Device connection registry ──
//
// Who is online, what they report, and synchronous request/reply for
// query-style agent calls. The HTTP-backed implementation wraps
// `edgesync_api::RegistryClient`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{DeviceId, DeviceVersions, Task};

/// What the registry knows about a device connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub device: DeviceId,
    pub connected: bool,
    pub versions: DeviceVersions,
    pub sync_hash: Option<String>,
}

impl From<edgesync_api::DeviceConnection> for ConnectionInfo {
    fn from(conn: edgesync_api::DeviceConnection) -> Self {
        Self {
            device: DeviceId::from(conn.device_id),
            connected: conn.connected,
            versions: DeviceVersions {
                agent: conn.versions.agent,
                router: conn.versions.router,
                firmware: conn.versions.firmware,
            },
            sync_hash: conn.sync_hash,
        }
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn connection(&self, device: &DeviceId) -> Result<Option<ConnectionInfo>, CoreError>;

    async fn is_connected(&self, device: &DeviceId) -> Result<bool, CoreError> {
        Ok(self
            .connection(device)
            .await?
            .is_some_and(|c| c.connected))
    }

    /// Send one task and wait for the agent's reply, bounded by `timeout`.
    async fn request(
        &self,
        device: &DeviceId,
        task: &Task,
        timeout: Duration,
    ) -> Result<Value, CoreError>;
}

// ── In-memory registry ──────────────────────────────────────────────

/// Canned connections and replies keyed by `(device, message)`.
#[derive(Default)]
pub struct MemoryRegistry {
    connections: DashMap<DeviceId, ConnectionInfo>,
    replies: DashMap<(DeviceId, String), Value>,
    /// Simulated round-trip latency.
    latency: DashMap<DeviceId, Duration>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, info: ConnectionInfo) {
        self.connections.insert(info.device.clone(), info);
    }

    pub fn disconnect(&self, device: &DeviceId) {
        if let Some(mut conn) = self.connections.get_mut(device) {
            conn.connected = false;
        }
    }

    pub fn set_reply(&self, device: impl Into<DeviceId>, message: &str, reply: Value) {
        self.replies.insert((device.into(), message.to_owned()), reply);
    }

    pub fn set_latency(&self, device: impl Into<DeviceId>, latency: Duration) {
        self.latency.insert(device.into(), latency);
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn connection(&self, device: &DeviceId) -> Result<Option<ConnectionInfo>, CoreError> {
        Ok(self.connections.get(device).map(|r| r.value().clone()))
    }

    async fn request(
        &self,
        device: &DeviceId,
        task: &Task,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        if !self.is_connected(device).await? {
            return Err(CoreError::DeviceUnreachable {
                device: device.to_string(),
            });
        }
        let latency = self.latency.get(device).map(|r| *r.value());
        let reply = self
            .replies
            .get(&(device.clone(), task.message.clone()))
            .map(|r| r.value().clone());

        let round_trip = async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            reply.ok_or_else(|| CoreError::Agent {
                message: format!("no handler for {}", task.message),
            })
        };
        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            })?
    }
}

// ── HTTP registry ───────────────────────────────────────────────────

/// Registry backed by the remote connection service.
pub struct HttpRegistry {
    client: edgesync_api::RegistryClient,
}

impl HttpRegistry {
    pub fn new(client: edgesync_api::RegistryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRegistry for HttpRegistry {
    async fn connection(&self, device: &DeviceId) -> Result<Option<ConnectionInfo>, CoreError> {
        match self.client.get_device(device.as_str()).await {
            Ok(conn) => Ok(Some(conn.into())),
            Err(e) if e.is_not_found() => {
                debug!(device = %device, "device unknown to registry");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn request(
        &self,
        device: &DeviceId,
        task: &Task,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        let message = edgesync_api::AgentMessage::from(task.clone());
        self.client
            .send_request(device.as_str(), &message, timeout)
            .await
            .map_err(|e| match e {
                edgesync_api::Error::DeviceOffline { .. } => CoreError::DeviceUnreachable {
                    device: device.to_string(),
                },
                other => other.into(),
            })
    }
}
