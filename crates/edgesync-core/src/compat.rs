// ── Version compatibility layer ──
//
// Pure functions shaping desired configuration into agent parameters
// for a given agent version. Older agents reject unknown fields, so
// every gated field is omitted (or reshaped) below its threshold.

use serde_json::{Map, Value, json};

use crate::error::CoreError;
use crate::model::{
    AgentVersion, AppIdentification, Device, DhcpConfig, Feature, FirewallDirection,
    FirewallPolicy, Interface, NotificationsConfig, QosPolicy, QueueShare, RoutingFilter,
    StaticRoute, TrafficMap, VrrpGroup, VrrpMember,
};

/// Agent message names.
pub mod messages {
    pub const ADD_QOS_POLICY: &str = "add-qos-policy";
    pub const REMOVE_QOS_POLICY: &str = "remove-qos-policy";
    pub const ADD_QOS_TRAFFIC_MAP: &str = "add-qos-traffic-map";
    pub const REMOVE_QOS_TRAFFIC_MAP: &str = "remove-qos-traffic-map";
    pub const ADD_APPLICATION: &str = "add-application";
    pub const REMOVE_APPLICATION: &str = "remove-application";
    pub const ADD_FIREWALL_POLICY: &str = "add-firewall-policy";
    pub const REMOVE_FIREWALL_POLICY: &str = "remove-firewall-policy";
    pub const ADD_NOTIFICATIONS: &str = "add-notifications-config";
    pub const REMOVE_NOTIFICATIONS: &str = "remove-notifications-config";
    pub const ADD_DHCP_CONFIG: &str = "add-dhcp-config";
    pub const REMOVE_DHCP_CONFIG: &str = "remove-dhcp-config";
    pub const ADD_ROUTE: &str = "add-route";
    pub const REMOVE_ROUTE: &str = "remove-route";
    pub const ADD_VRRP_GROUP: &str = "add-vrrp-group";
    pub const REMOVE_VRRP_GROUP: &str = "remove-vrrp-group";
    pub const MODIFY_INTERFACE: &str = "modify-interface";
    pub const ADD_ROUTING_FILTER: &str = "add-routing-filter";
    pub const REMOVE_ROUTING_FILTER: &str = "remove-routing-filter";
    pub const UPGRADE_DEVICE_SW: &str = "upgrade-device-sw";
    pub const GET_ROUTER_CONFIG: &str = "get-router-config";
}

// ── Feature availability ────────────────────────────────────────────

/// Minimum agent `(major, minor)` for features that older agents lack.
pub fn minimum_version(feature: Feature) -> Option<(u32, u32)> {
    match feature {
        Feature::QosPolicy | Feature::QosTrafficMap => Some((6, 0)),
        Feature::Vrrp => Some((6, 1)),
        Feature::Notifications => Some((6, 3)),
        _ => None,
    }
}

pub fn supports(feature: Feature, version: &AgentVersion) -> bool {
    minimum_version(feature).is_none_or(|(major, minor)| version.at_least(major, minor))
}

/// Reject `feature` for a device whose agent is too old.
pub fn require(feature: Feature, device: &Device) -> Result<(), CoreError> {
    let version = device.agent_version();
    match minimum_version(feature) {
        Some((major, minor)) if !version.at_least(major, minor) => Err(CoreError::Unsupported {
            feature: feature.to_string(),
            device: device.id.to_string(),
            version: version.to_string(),
            required: format!("{major}.{minor}"),
        }),
        _ => Ok(()),
    }
}

// ── Interfaces ──────────────────────────────────────────────────────

/// Routing protocols: a list from 5.3, a comma-joined string before.
pub fn transform_routing_protocols(routing: &[String], version: &AgentVersion) -> Value {
    if version.at_least(5, 3) {
        json!(routing)
    } else if routing.is_empty() {
        json!("NONE")
    } else {
        json!(routing.join(","))
    }
}

pub fn transform_interface(ifc: &Interface, version: &AgentVersion) -> Value {
    let mut params = Map::new();
    params.insert("devId".into(), json!(ifc.dev_id));
    params.insert("type".into(), json!(ifc.kind.to_string()));
    if let Some(ip) = &ifc.ip {
        params.insert("addr".into(), json!(ip));
    }
    if let Some(gw) = &ifc.gateway {
        params.insert("gateway".into(), json!(gw));
    }
    if let Some(metric) = ifc.metric {
        params.insert("metric".into(), json!(metric));
    }
    params.insert(
        "routing".into(),
        transform_routing_protocols(&ifc.routing, version),
    );
    Value::Object(params)
}

// ── Routing filters ─────────────────────────────────────────────────

/// From 6.2 rules carry their own `action`, `nextHop` and `priority`.
/// Older agents only know a filter-wide `defaultAction` with a plain
/// route list that gets the opposite action, so only rules whose action
/// differs from the default are sent.
pub fn transform_routing_filter(filter: &RoutingFilter, version: &AgentVersion) -> Value {
    if version.at_least(6, 2) {
        let rules: Vec<Value> = filter
            .rules
            .iter()
            .map(|r| {
                let mut rule = json!({
                    "route": r.route,
                    "action": r.action,
                    "priority": r.priority,
                });
                if let Some(hop) = &r.next_hop {
                    rule["nextHop"] = json!(hop);
                }
                rule
            })
            .collect();
        json!({
            "name": filter.name,
            "description": filter.description,
            "defaultAction": filter.default_action,
            "rules": rules,
        })
    } else {
        let rules: Vec<Value> = filter
            .rules
            .iter()
            .filter(|r| r.action != filter.default_action)
            .map(|r| json!({ "route": r.route }))
            .collect();
        json!({
            "name": filter.name,
            "description": filter.description,
            "defaultAction": filter.default_action,
            "rules": rules,
        })
    }
}

pub fn transform_routing_filters(filters: &[RoutingFilter], version: &AgentVersion) -> Vec<Value> {
    filters
        .iter()
        .map(|f| transform_routing_filter(f, version))
        .collect()
}

// ── DHCP ────────────────────────────────────────────────────────────

pub fn transform_dhcp(config: &DhcpConfig, routers: Option<&str>, version: &AgentVersion) -> Value {
    let mac_assign: Vec<Value> = config
        .mac_assign
        .iter()
        .map(|m| {
            let mut entry = json!({ "host": m.host, "mac": m.mac, "ipv4": m.ipv4 });
            if version.at_least(6, 1) {
                entry["useHostNameAsDhcpOption"] = json!(m.use_host_name_as_dhcp_option);
            }
            entry
        })
        .collect();

    let mut params = json!({
        "interface": config.interface,
        "rangeStart": config.range_start,
        "rangeEnd": config.range_end,
        "dns": config.dns,
        "macAssign": mac_assign,
    });
    if version.at_least(5, 2) {
        params["options"] = json!(config.options);
    }
    if let Some(routers) = routers {
        params["routers"] = json!(routers);
    }
    params
}

// ── Static routes ───────────────────────────────────────────────────

pub fn transform_static_route(route: &StaticRoute, version: &AgentVersion) -> Value {
    let mut params = json!({
        "addr": route.destination,
        "via": route.gateway,
    });
    if let Some(dev_id) = &route.interface {
        params["devId"] = json!(dev_id);
    }
    if let Some(metric) = route.metric {
        params["metric"] = json!(metric);
    }
    if version.at_least(5, 2) {
        params["onLink"] = json!(route.on_link);
    }
    if version.at_least(5, 3) {
        params["redistributeViaOSPF"] = json!(route.redistribute_via_ospf);
    }
    if version.at_least(6, 1) {
        params["redistributeViaBGP"] = json!(route.redistribute_via_bgp);
    }
    params
}

// ── QoS ─────────────────────────────────────────────────────────────

const REALTIME_QUEUE: &str = "realtime";

fn queues(shares: &std::collections::BTreeMap<String, QueueShare>, version: &AgentVersion) -> Value {
    let filtered: Map<String, Value> = shares
        .iter()
        .filter(|(name, _)| version.at_least(6, 1) || name.as_str() != REALTIME_QUEUE)
        .map(|(name, share)| (name.clone(), json!(share)))
        .collect();
    Value::Object(filtered)
}

pub fn transform_qos_policy(
    policy: &QosPolicy,
    interfaces: &[String],
    version: &AgentVersion,
) -> Value {
    json!({
        "id": policy.id,
        "name": policy.name,
        "interfaces": interfaces,
        "outbound": queues(&policy.outbound, version),
        "inbound": queues(&policy.inbound, version),
    })
}

pub fn transform_traffic_map(map: &TrafficMap, _version: &AgentVersion) -> Value {
    json!({
        "revision": map.revision,
        "classes": map.classes,
    })
}

// ── Application identification ──────────────────────────────────────

pub fn transform_app_identification(db: &AppIdentification, version: &AgentVersion) -> Value {
    let applications: Vec<Value> = db
        .applications
        .iter()
        .map(|app| {
            let mut entry = json!({ "id": app.id, "name": app.name, "rules": app.rules });
            if version.at_least(6, 0) {
                if let Some(category) = &app.category {
                    entry["category"] = json!(category);
                }
                if let Some(class) = &app.service_class {
                    entry["serviceClass"] = json!(class);
                }
                if let Some(importance) = &app.importance {
                    entry["importance"] = json!(importance);
                }
            }
            entry
        })
        .collect();
    json!({ "revision": db.revision, "applications": applications })
}

// ── Firewall ────────────────────────────────────────────────────────

pub fn transform_firewall(policy: &FirewallPolicy, version: &AgentVersion) -> Value {
    let rules: Vec<Value> = policy
        .rules
        .iter()
        .filter(|r| version.at_least(5, 3) || r.direction != FirewallDirection::Outbound)
        .map(|r| {
            let mut rule = json!({
                "priority": r.priority,
                "direction": r.direction,
                "action": r.action,
                "source": r.source,
                "destination": r.destination,
            });
            if let Some(app) = &r.application {
                rule["application"] = json!(app);
            }
            rule
        })
        .collect();
    json!({ "id": policy.id, "rules": rules })
}

// ── VRRP ────────────────────────────────────────────────────────────

pub fn transform_vrrp(group: &VrrpGroup, member: &VrrpMember, version: &AgentVersion) -> Value {
    let mut params = json!({
        "virtualRouterId": group.virtual_router_id,
        "virtualIp": group.virtual_ip,
        "preemption": group.preemption,
        "acceptMode": group.accept_mode,
        "priority": member.priority,
        "devId": member.interface,
    });
    if version.at_least(6, 2) {
        params["trackInterfacesMandatory"] = json!(member.track_interfaces_mandatory);
        params["trackInterfacesOptional"] = json!(member.track_interfaces_optional);
    } else {
        let merged: Vec<&String> = member
            .track_interfaces_mandatory
            .iter()
            .chain(&member.track_interfaces_optional)
            .collect();
        params["trackInterfaces"] = json!(merged);
    }
    params
}

// ── Notifications ───────────────────────────────────────────────────

pub fn transform_notifications(config: &NotificationsConfig, _version: &AgentVersion) -> Value {
    json!({ "rules": config.rules })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{
        Application, DhcpOption, FilterAction, FirewallRule, InterfaceKind, MacAssignment,
        RoutingFilterRule,
    };
    use pretty_assertions::assert_eq;

    fn v(s: &str) -> AgentVersion {
        s.parse().unwrap()
    }

    fn filter() -> RoutingFilter {
        RoutingFilter {
            name: "upstream".into(),
            description: "drop bogons".into(),
            default_action: FilterAction::Allow,
            rules: vec![
                RoutingFilterRule {
                    route: "10.0.0.0/8".into(),
                    action: FilterAction::Deny,
                    next_hop: None,
                    priority: 1,
                },
                RoutingFilterRule {
                    route: "192.168.0.0/16".into(),
                    action: FilterAction::Allow,
                    next_hop: Some("10.1.1.1".into()),
                    priority: 2,
                },
            ],
        }
    }

    #[test]
    fn routing_filter_before_6_2_synthesizes_default_action() {
        let params = transform_routing_filter(&filter(), &v("6.1.0"));
        assert_eq!(
            params,
            json!({
                "name": "upstream",
                "description": "drop bogons",
                "defaultAction": "allow",
                "rules": [{ "route": "10.0.0.0/8" }],
            })
        );
        for rule in params["rules"].as_array().unwrap() {
            assert!(rule.get("action").is_none());
            assert!(rule.get("nextHop").is_none());
            assert!(rule.get("priority").is_none());
        }
    }

    #[test]
    fn routing_filter_from_6_2_is_verbatim() {
        let params = transform_routing_filter(&filter(), &v("6.2.0"));
        assert_eq!(
            params["rules"],
            json!([
                { "route": "10.0.0.0/8", "action": "deny", "priority": 1 },
                { "route": "192.168.0.0/16", "action": "allow", "priority": 2, "nextHop": "10.1.1.1" },
            ])
        );
        assert_eq!(params["defaultAction"], "allow");
    }

    #[test]
    fn routing_protocols_switch_shape_at_5_3() {
        let protocols = vec!["OSPF".to_owned(), "BGP".to_owned()];
        assert_eq!(
            transform_routing_protocols(&protocols, &v("5.2.9")),
            json!("OSPF,BGP")
        );
        assert_eq!(
            transform_routing_protocols(&protocols, &v("5.3.0")),
            json!(["OSPF", "BGP"])
        );
        assert_eq!(transform_routing_protocols(&[], &v("5.1")), json!("NONE"));
    }

    #[test]
    fn interface_params_carry_address_and_routing() {
        let ifc = Interface {
            dev_id: "pci:0000:00:03.00".into(),
            name: "eth1".into(),
            assigned: true,
            kind: InterfaceKind::Lan,
            ip: Some("192.168.1.1/24".into()),
            gateway: None,
            metric: Some(100),
            routing: vec!["OSPF".into()],
            qos_policy: None,
        };
        assert_eq!(
            transform_interface(&ifc, &v("6.0")),
            json!({
                "devId": "pci:0000:00:03.00",
                "type": "LAN",
                "addr": "192.168.1.1/24",
                "metric": 100,
                "routing": ["OSPF"],
            })
        );
    }

    #[test]
    fn dhcp_gates_options_and_host_name_flag() {
        let config = DhcpConfig {
            id: "dh1".into(),
            interface: "L".into(),
            range_start: "192.168.1.10".into(),
            range_end: "192.168.1.100".into(),
            dns: vec!["8.8.8.8".into()],
            mac_assign: vec![MacAssignment {
                host: "printer".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                ipv4: "192.168.1.5".into(),
                use_host_name_as_dhcp_option: true,
            }],
            options: vec![DhcpOption {
                option: "domain-name".into(),
                value: "lan".into(),
            }],
        };

        let old = transform_dhcp(&config, Some("192.168.1.1"), &v("5.1.0"));
        assert!(old.get("options").is_none());
        assert!(old["macAssign"][0].get("useHostNameAsDhcpOption").is_none());
        assert_eq!(old["routers"], "192.168.1.1");

        let mid = transform_dhcp(&config, None, &v("6.0.0"));
        assert_eq!(mid["options"][0]["option"], "domain-name");
        assert!(mid["macAssign"][0].get("useHostNameAsDhcpOption").is_none());
        assert!(mid.get("routers").is_none());

        let new = transform_dhcp(&config, None, &v("6.1.0"));
        assert_eq!(new["macAssign"][0]["useHostNameAsDhcpOption"], true);
    }

    #[test]
    fn static_route_fields_appear_by_version() {
        let route = StaticRoute {
            id: "r1".into(),
            destination: "10.10.0.0/16".into(),
            gateway: "192.168.1.254".into(),
            interface: None,
            metric: Some(5),
            redistribute_via_ospf: true,
            redistribute_via_bgp: true,
            on_link: false,
        };
        let old = transform_static_route(&route, &v("5.1"));
        assert_eq!(
            old,
            json!({ "addr": "10.10.0.0/16", "via": "192.168.1.254", "metric": 5 })
        );
        let mid = transform_static_route(&route, &v("5.3"));
        assert_eq!(mid["redistributeViaOSPF"], true);
        assert!(mid.get("redistributeViaBGP").is_none());
        let new = transform_static_route(&route, &v("6.1"));
        assert_eq!(new["redistributeViaBGP"], true);
        assert_eq!(new["onLink"], false);
    }

    #[test]
    fn qos_drops_realtime_queue_before_6_1() {
        let mut outbound = std::collections::BTreeMap::new();
        for name in ["realtime", "best-effort"] {
            outbound.insert(
                name.to_owned(),
                QueueShare {
                    bandwidth_limit_percent: 30,
                    dscp_rewrite: None,
                    weight: None,
                },
            );
        }
        let policy = QosPolicy {
            id: "P".into(),
            org: "o".into(),
            name: "default".into(),
            description: String::new(),
            outbound,
            inbound: std::collections::BTreeMap::new(),
        };
        let old = transform_qos_policy(&policy, &["X".into()], &v("6.0.3"));
        assert!(old["outbound"].get("realtime").is_none());
        assert_eq!(old["interfaces"], json!(["X"]));
        let new = transform_qos_policy(&policy, &["X".into()], &v("6.1.0"));
        assert!(new["outbound"].get("realtime").is_some());
    }

    #[test]
    fn app_identification_strips_classification_before_6_0() {
        let db = AppIdentification {
            org: "o".into(),
            revision: 4,
            applications: vec![Application {
                id: "zoom".into(),
                name: "Zoom".into(),
                category: Some("conferencing".into()),
                service_class: Some("real-time".into()),
                importance: Some("high".into()),
                rules: vec![],
            }],
        };
        let old = transform_app_identification(&db, &v("5.3"));
        assert!(old["applications"][0].get("category").is_none());
        let new = transform_app_identification(&db, &v("6.0"));
        assert_eq!(new["applications"][0]["serviceClass"], "real-time");
    }

    #[test]
    fn firewall_outbound_rules_need_5_3() {
        let rule = |direction| FirewallRule {
            priority: 1,
            direction,
            action: FilterAction::Deny,
            source: Value::Null,
            destination: Value::Null,
            application: None,
        };
        let policy = FirewallPolicy {
            id: "fw".into(),
            org: "o".into(),
            name: "edge".into(),
            rules: vec![
                rule(FirewallDirection::Inbound),
                rule(FirewallDirection::Outbound),
            ],
        };
        assert_eq!(
            transform_firewall(&policy, &v("5.2"))["rules"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            transform_firewall(&policy, &v("5.3"))["rules"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn vrrp_track_lists_split_at_6_2() {
        let group = VrrpGroup {
            id: "g".into(),
            org: "o".into(),
            name: "lan-ha".into(),
            virtual_router_id: 7,
            virtual_ip: "192.168.1.1".into(),
            preemption: true,
            accept_mode: false,
            members: vec![],
        };
        let member = VrrpMember {
            device: "d1".into(),
            interface: "L".into(),
            priority: 200,
            track_interfaces_mandatory: vec!["W1".into()],
            track_interfaces_optional: vec!["W2".into()],
        };
        let old = transform_vrrp(&group, &member, &v("6.1"));
        assert_eq!(old["trackInterfaces"], json!(["W1", "W2"]));
        let new = transform_vrrp(&group, &member, &v("6.2"));
        assert_eq!(new["trackInterfacesMandatory"], json!(["W1"]));
        assert!(new.get("trackInterfaces").is_none());
    }

    #[test]
    fn feature_gates() {
        assert!(!supports(Feature::QosPolicy, &v("5.9")));
        assert!(supports(Feature::QosPolicy, &v("6.0")));
        assert!(!supports(Feature::Vrrp, &v("6.0")));
        assert!(!supports(Feature::Notifications, &v("6.2")));
        assert!(supports(Feature::Dhcp, &AgentVersion::default()));

        let mut dev = Device::new("d1", "o");
        dev.versions.agent = Some("6.0.0".into());
        let err = require(Feature::Vrrp, &dev).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("requires 6.1"));
    }
}
