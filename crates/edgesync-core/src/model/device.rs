// ── Device domain types ──
//
// A device document carries reported versions, interfaces, embedded
// routing documents (DHCP entries, static routes, routing filters) and
// the per-feature state records the engine maintains.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use super::entity_id::{DeviceId, JobId, OrgId, PolicyId};
use super::feature::{Feature, FeatureState, FeatureStatus};
use super::policy::RoutingFilter;
use super::version::AgentVersion;

// ── Versions ────────────────────────────────────────────────────────

/// Versions the device reported on its last connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

// ── Interfaces ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum InterfaceKind {
    Wan,
    Lan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Agent-side interface identifier (bus address).
    pub dev_id: String,
    pub name: String,
    #[serde(default)]
    pub assigned: bool,
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    /// Address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    /// Routing protocols enabled on the interface (`OSPF`, `BGP`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing: Vec<String>,
    /// Interface-level QoS policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos_policy: Option<PolicyId>,
}

impl Interface {
    /// Address without the prefix length.
    pub fn address(&self) -> Option<&str> {
        self.ip.as_deref().map(|ip| ip.split('/').next().unwrap_or(ip))
    }
}

// ── DHCP ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacAssignment {
    pub host: String,
    pub mac: String,
    pub ipv4: String,
    #[serde(default)]
    pub use_host_name_as_dhcp_option: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOption {
    pub option: String,
    pub value: String,
}

/// DHCP server configuration for one LAN interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpConfig {
    pub id: PolicyId,
    pub interface: String,
    pub range_start: String,
    pub range_end: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub mac_assign: Vec<MacAssignment>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpEntry {
    pub config: DhcpConfig,
    #[serde(default)]
    pub state: FeatureState,
}

// ── Static routes ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticRoute {
    pub id: PolicyId,
    pub destination: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default, rename = "redistributeViaOSPF")]
    pub redistribute_via_ospf: bool,
    #[serde(default, rename = "redistributeViaBGP")]
    pub redistribute_via_bgp: bool,
    #[serde(default)]
    pub on_link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRouteEntry {
    pub route: StaticRoute,
    #[serde(default)]
    pub state: FeatureState,
}

// ── VRRP membership ─────────────────────────────────────────────────

/// What the device was told about one VRRP group, kept so a leaving
/// member can be torn down after the group document changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrrpMembership {
    pub interface: String,
    pub virtual_ip: String,
    pub virtual_router_id: u8,
    /// `add-vrrp-group` parameters last sent to the device.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default)]
    pub state: FeatureState,
}

impl VrrpMembership {
    /// The router is (or is about to be) running this group.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state.status,
            FeatureStatus::Installing | FeatureStatus::Installed | FeatureStatus::UninstallFailed
        )
    }
}

// ── Application identification clients ──────────────────────────────

/// Features that need the application-signature DB on the device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum AppClient {
    Operator,
    QosPolicy,
    FirewallPolicy,
}

// ── Upgrade ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeState {
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<DateTime<Utc>>,
}

// ── Sync ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    NoSyncNeeded,
    SyncRequested,
    SyncInFlight,
    SyncConfirmed,
    SyncFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<DateTime<Utc>>,
    /// Fingerprint of the last full request list sent or confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,
}

// ── Device ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub org: OrgId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub versions: DeviceVersions,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub routing_filters: Vec<RoutingFilter>,
    #[serde(default)]
    pub dhcp: Vec<DhcpEntry>,
    #[serde(default)]
    pub static_routes: Vec<StaticRouteEntry>,
    /// Membership per VRRP group.
    #[serde(default)]
    pub vrrp: BTreeMap<PolicyId, VrrpMembership>,
    /// Singleton feature states, at most one per feature.
    #[serde(default)]
    pub features: BTreeMap<Feature, FeatureState>,
    #[serde(default)]
    pub app_clients: BTreeSet<AppClient>,
    #[serde(default)]
    pub upgrade: UpgradeState,
    #[serde(default)]
    pub sync: SyncState,
    /// Store revision, bumped on every save.
    #[serde(default)]
    pub revision: u64,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, org: impl Into<OrgId>) -> Self {
        Self {
            id: id.into(),
            org: org.into(),
            name: String::new(),
            approved: true,
            versions: DeviceVersions::default(),
            interfaces: Vec::new(),
            routing_filters: Vec::new(),
            dhcp: Vec::new(),
            static_routes: Vec::new(),
            vrrp: BTreeMap::new(),
            features: BTreeMap::new(),
            app_clients: BTreeSet::new(),
            upgrade: UpgradeState::default(),
            sync: SyncState::default(),
            revision: 0,
        }
    }

    pub fn agent_version(&self) -> AgentVersion {
        AgentVersion::from_reported(self.versions.agent.as_deref())
    }

    /// Current state for a singleton feature (default when never applied).
    pub fn state(&self, feature: Feature) -> FeatureState {
        self.features.get(&feature).cloned().unwrap_or_default()
    }

    pub fn state_mut(&mut self, feature: Feature) -> &mut FeatureState {
        self.features.entry(feature).or_default()
    }

    pub fn interface(&self, dev_id: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.dev_id == dev_id)
    }

    pub fn interface_mut(&mut self, dev_id: &str) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.dev_id == dev_id)
    }

    pub fn wan_interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces
            .iter()
            .filter(|i| i.assigned && i.kind == InterfaceKind::Wan)
    }

    pub fn dhcp_entry(&self, id: &PolicyId) -> Option<&DhcpEntry> {
        self.dhcp.iter().find(|e| &e.config.id == id)
    }

    pub fn dhcp_entry_mut(&mut self, id: &PolicyId) -> Option<&mut DhcpEntry> {
        self.dhcp.iter_mut().find(|e| &e.config.id == id)
    }

    pub fn static_route(&self, id: &PolicyId) -> Option<&StaticRouteEntry> {
        self.static_routes.iter().find(|e| &e.route.id == id)
    }

    pub fn static_route_mut(&mut self, id: &PolicyId) -> Option<&mut StaticRouteEntry> {
        self.static_routes.iter_mut().find(|e| &e.route.id == id)
    }

    /// Gateway handed to DHCP clients on a LAN interface: the virtual IP
    /// of an active VRRP group on that interface, else the interface's
    /// own address.
    pub fn dhcp_routers(&self, dev_id: &str) -> Option<String> {
        self.vrrp
            .values()
            .find(|m| m.interface == dev_id && m.is_active())
            .map(|m| m.virtual_ip.clone())
            .or_else(|| {
                self.interface(dev_id)
                    .and_then(Interface::address)
                    .map(str::to_owned)
            })
    }

    /// WAN interfaces grouped by the QoS policy that applies to them.
    ///
    /// An interface override wins over the device default.
    pub fn effective_qos(&self) -> BTreeMap<PolicyId, Vec<String>> {
        let default = self.state(Feature::QosPolicy).policy;
        let mut grouped: BTreeMap<PolicyId, Vec<String>> = BTreeMap::new();
        for ifc in self.wan_interfaces() {
            if let Some(policy) = ifc.qos_policy.clone().or_else(|| default.clone()) {
                grouped.entry(policy).or_default().push(ifc.dev_id.clone());
            }
        }
        grouped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn wan(dev_id: &str, policy: Option<&str>) -> Interface {
        Interface {
            dev_id: dev_id.into(),
            name: dev_id.into(),
            assigned: true,
            kind: InterfaceKind::Wan,
            ip: Some("10.0.0.2/24".into()),
            gateway: Some("10.0.0.1".into()),
            metric: None,
            routing: Vec::new(),
            qos_policy: policy.map(PolicyId::from),
        }
    }

    #[test]
    fn interface_override_wins_over_default() {
        let mut dev = Device::new("d1", "org");
        dev.interfaces = vec![wan("X", None), wan("Y", Some("P2"))];
        dev.state_mut(Feature::QosPolicy).policy = Some("P1".into());

        let grouped = dev.effective_qos();
        assert_eq!(grouped[&PolicyId::from("P1")], vec!["X".to_owned()]);
        assert_eq!(grouped[&PolicyId::from("P2")], vec!["Y".to_owned()]);
    }

    #[test]
    fn unassigned_and_lan_interfaces_are_not_wan() {
        let mut dev = Device::new("d1", "org");
        let mut lan = wan("L", None);
        lan.kind = InterfaceKind::Lan;
        let mut idle = wan("I", None);
        idle.assigned = false;
        dev.interfaces = vec![lan, idle, wan("W", None)];
        let ids: Vec<_> = dev.wan_interfaces().map(|i| i.dev_id.as_str()).collect();
        assert_eq!(ids, vec!["W"]);
    }

    #[test]
    fn dhcp_routers_prefer_active_vrrp_group() {
        let mut dev = Device::new("d1", "org");
        let mut lan = wan("L", None);
        lan.kind = InterfaceKind::Lan;
        lan.ip = Some("192.168.1.2/24".into());
        dev.interfaces = vec![lan];
        assert_eq!(dev.dhcp_routers("L").as_deref(), Some("192.168.1.2"));

        let mut membership = VrrpMembership {
            interface: "L".into(),
            virtual_ip: "192.168.1.1".into(),
            virtual_router_id: 7,
            params: Value::Null,
            state: FeatureState::default(),
        };
        membership.state.status = FeatureStatus::Installing;
        dev.vrrp.insert("G1".into(), membership);
        assert_eq!(dev.dhcp_routers("L").as_deref(), Some("192.168.1.1"));

        dev.vrrp.get_mut(&PolicyId::from("G1")).unwrap().state.status =
            FeatureStatus::Uninstalling;
        assert_eq!(dev.dhcp_routers("L").as_deref(), Some("192.168.1.2"));
    }

    #[test]
    fn address_strips_prefix() {
        let ifc = wan("X", None);
        assert_eq!(ifc.address(), Some("10.0.0.2"));
    }

    #[test]
    fn device_round_trips_through_json() {
        let mut dev = Device::new("d1", "org");
        dev.state_mut(Feature::QosPolicy).status = FeatureStatus::Installed;
        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["features"]["qosPolicy"]["status"], "installed");
        let back: Device = serde_json::from_value(json).unwrap();
        assert_eq!(back, dev);
    }
}
