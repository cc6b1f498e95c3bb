// ── Desired policy documents ──
//
// Owned by the operator API. The engine reads them to build tasks and
// never writes them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use super::entity_id::{DeviceId, OrgId, PolicyId};

// ── QoS ─────────────────────────────────────────────────────────────

/// Bandwidth share for one traffic queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueShare {
    pub bandwidth_limit_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dscp_rewrite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosPolicy {
    pub id: PolicyId,
    pub org: OrgId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Outbound queues keyed by class (`realtime`, `control-signaling`, ...).
    #[serde(default)]
    pub outbound: BTreeMap<String, QueueShare>,
    #[serde(default)]
    pub inbound: BTreeMap<String, QueueShare>,
}

// ── Traffic map ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficClass {
    pub service_class: String,
    pub importance: String,
    pub queue: String,
}

/// Org-wide mapping from traffic classification to QoS queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficMap {
    pub org: OrgId,
    pub revision: u64,
    #[serde(default)]
    pub classes: Vec<TrafficClass>,
}

// ── Application identification ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    #[serde(default)]
    pub rules: Vec<Value>,
}

/// Org application-signature database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentification {
    pub org: OrgId,
    pub revision: u64,
    #[serde(default)]
    pub applications: Vec<Application>,
}

// ── Firewall ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FirewallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub priority: u32,
    pub direction: FirewallDirection,
    pub action: FilterAction,
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub destination: Value,
    /// Application id matched by this rule. Rules that match on
    /// applications need the signature DB installed first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub id: PolicyId,
    pub org: OrgId,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

impl FirewallPolicy {
    pub fn uses_applications(&self) -> bool {
        self.rules.iter().any(|r| r.application.is_some())
    }
}

// ── VRRP ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrrpMember {
    pub device: DeviceId,
    /// LAN interface `devId` carrying the virtual address.
    pub interface: String,
    pub priority: u8,
    #[serde(default)]
    pub track_interfaces_mandatory: Vec<String>,
    #[serde(default)]
    pub track_interfaces_optional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrrpGroup {
    pub id: PolicyId,
    pub org: OrgId,
    pub name: String,
    pub virtual_router_id: u8,
    pub virtual_ip: String,
    #[serde(default)]
    pub preemption: bool,
    #[serde(default)]
    pub accept_mode: bool,
    #[serde(default)]
    pub members: Vec<VrrpMember>,
}

impl VrrpGroup {
    pub fn member(&self, device: &DeviceId) -> Option<&VrrpMember> {
        self.members.iter().find(|m| &m.device == device)
    }
}

// ── Routing filters ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FilterAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingFilterRule {
    pub route: String,
    pub action: FilterAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingFilter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default_action: FilterAction,
    #[serde(default)]
    pub rules: Vec<RoutingFilterRule>,
}

// ── Notifications ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<u64>,
}

/// Org notification thresholds pushed to every device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub org: OrgId,
    pub revision: u64,
    #[serde(default)]
    pub rules: BTreeMap<String, Threshold>,
}

// ── PolicyDocument ──────────────────────────────────────────────────

/// Any desired-policy document, as stored or imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PolicyDocument {
    QosPolicy(QosPolicy),
    TrafficMap(TrafficMap),
    AppIdentification(AppIdentification),
    FirewallPolicy(FirewallPolicy),
    VrrpGroup(VrrpGroup),
    Notifications(NotificationsConfig),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policy_document_is_internally_tagged() {
        let doc: PolicyDocument = serde_json::from_value(json!({
            "kind": "trafficMap",
            "org": "o1",
            "revision": 3,
            "classes": []
        }))
        .unwrap();
        assert!(matches!(doc, PolicyDocument::TrafficMap(ref m) if m.revision == 3));
    }

    #[test]
    fn firewall_policy_detects_application_rules() {
        let mut policy = FirewallPolicy {
            id: "fw".into(),
            org: "o1".into(),
            name: "edge".into(),
            rules: vec![FirewallRule {
                priority: 1,
                direction: FirewallDirection::Inbound,
                action: FilterAction::Deny,
                source: Value::Null,
                destination: Value::Null,
                application: None,
            }],
        };
        assert!(!policy.uses_applications());
        policy.rules[0].application = Some("youtube".into());
        assert!(policy.uses_applications());
    }
}
