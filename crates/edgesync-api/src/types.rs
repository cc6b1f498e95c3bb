// Wire types for the device connection registry.
//
// Field names follow the registry's camelCase JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command on the device message protocol: `{entity, message, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub entity: String,
    pub message: String,
    #[serde(default)]
    pub params: Value,
}

/// Versions reported by the device on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceVersions {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub router: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
}

/// Connection record for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    pub device_id: String,
    pub connected: bool,
    #[serde(default)]
    pub versions: DeviceVersions,
    /// Configuration fingerprint last reported by the agent.
    #[serde(default)]
    pub sync_hash: Option<String>,
}

/// `{data: [...]}` envelope used by list endpoints.
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

/// Reply to a synchronous agent request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_defaults_missing_fields() {
        let conn: DeviceConnection =
            serde_json::from_value(json!({"deviceId": "d1", "connected": true})).unwrap();
        assert_eq!(conn.device_id, "d1");
        assert_eq!(conn.versions, DeviceVersions::default());
        assert!(conn.sync_hash.is_none());
    }

    #[test]
    fn agent_message_serializes_flat() {
        let msg = AgentMessage {
            entity: "agent".into(),
            message: "get-router-config".into(),
            params: Value::Null,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"entity": "agent", "message": "get-router-config", "params": null})
        );
    }
}
