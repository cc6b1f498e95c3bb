#![allow(clippy::unwrap_used)]
// Integration tests for per-device configuration: DHCP, interface
// modify with routing filters, VRRP membership and upgrades.

mod common;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use common::{Fleet, edge, messages};
use edgesync_core::model::{DhcpConfig, DhcpEntry, FeatureState, VrrpGroup, VrrpMember};
use edgesync_core::{
    CoreError, Device, DeviceId, Feature, FeatureStatus, Job, PolicyDocument, PolicyId,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn pool(start: &str, end: &str) -> DhcpConfig {
    DhcpConfig {
        id: "lan-pool".into(),
        interface: "L".into(),
        range_start: start.into(),
        range_end: end.into(),
        dns: Vec::new(),
        mac_assign: Vec::new(),
        options: Vec::new(),
    }
}

fn with_pool(mut dev: Device) -> Device {
    dev.dhcp.push(DhcpEntry {
        config: pool("192.168.1.10", "192.168.1.100"),
        state: FeatureState {
            status: FeatureStatus::Installed,
            ..FeatureState::default()
        },
    });
    dev
}

fn member(device: &str, priority: u8) -> VrrpMember {
    VrrpMember {
        device: device.into(),
        interface: "L".into(),
        priority,
        track_interfaces_mandatory: vec!["X".into()],
        track_interfaces_optional: Vec::new(),
    }
}

fn group(members: Vec<VrrpMember>) -> PolicyDocument {
    PolicyDocument::VrrpGroup(VrrpGroup {
        id: "G1".into(),
        org: "o1".into(),
        name: "branch-gw".into(),
        virtual_router_id: 12,
        virtual_ip: "192.168.1.1".into(),
        preemption: true,
        accept_mode: false,
        members,
    })
}

/// Params of the first task named `message` in a job.
fn params_of(job: &Job, message: &str) -> Value {
    job
        .flat_tasks()
        .into_iter()
        .find(|t| t.message == message)
        .map(|t| t.params)
        .unwrap()
}

fn filter() -> Value {
    json!({
        "name": "branch-out",
        "description": "",
        "defaultAction": "deny",
        "rules": [
            { "route": "10.0.0.0/8", "action": "allow", "priority": 1 },
            { "route": "172.16.0.0/12", "action": "deny", "priority": 2 }
        ]
    })
}

// ── DHCP ────────────────────────────────────────────────────────────

#[tokio::test]
async fn dhcp_modify_failure_restores_previous_pool() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(with_pool(edge("d1", "6.3.0"))).await;

    let outcome = fleet
        .apply(
            "dhcp",
            &["d1"],
            json!({
                "action": "modify",
                "id": "lan-pool",
                "dhcp": pool("192.168.1.50", "192.168.1.150"),
            }),
        )
        .await;
    let job = fleet.job(outcome.ids[0]).await;
    assert_eq!(messages(&job), vec!["remove-dhcp-config", "add-dhcp-config"]);
    assert_eq!(params_of(&job, "add-dhcp-config")["rangeStart"], "192.168.1.50");

    let dev = fleet.device("d1").await;
    assert_eq!(dev.dhcp[0].config.range_start, "192.168.1.50");
    assert_eq!(dev.dhcp[0].state.status, FeatureStatus::Installing);

    fleet.fail(job.id, "dnsmasq refused range").await;
    let dev = fleet.device("d1").await;
    assert_eq!(dev.dhcp[0].config.range_start, "192.168.1.10");
    assert_eq!(dev.dhcp[0].state.status, FeatureStatus::InstallFailed);
}

#[tokio::test]
async fn dhcp_removal_confirmed_by_device_drops_the_entry() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(with_pool(edge("d1", "6.3.0"))).await;

    let outcome = fleet
        .apply("dhcp", &["d1"], json!({ "action": "remove", "id": "lan-pool" }))
        .await;
    assert_eq!(
        fleet.device("d1").await.dhcp[0].state.status,
        FeatureStatus::Uninstalling
    );

    fleet.complete(outcome.ids[0]).await;
    assert!(fleet.device("d1").await.dhcp.is_empty());
}

#[tokio::test]
async fn deleted_dhcp_removal_lets_the_pending_add_finish() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(edge("d1", "6.3.0")).await;

    let add = fleet
        .apply(
            "dhcp",
            &["d1"],
            json!({ "action": "add", "dhcp": pool("192.168.1.10", "192.168.1.100") }),
        )
        .await;
    let remove = fleet
        .apply("dhcp", &["d1"], json!({ "action": "remove", "id": "lan-pool" }))
        .await;

    fleet.remove(remove.ids[0]).await;
    assert_eq!(
        fleet.device("d1").await.dhcp[0].state.status,
        FeatureStatus::Installing
    );

    fleet.complete(add.ids[0]).await;
    assert_eq!(
        fleet.device("d1").await.dhcp[0].state.status,
        FeatureStatus::Installed
    );
}

#[tokio::test]
async fn dhcp_on_a_wan_interface_is_rejected() {
    let fleet = Fleet::new().await;
    fleet.add_device(edge("d1", "6.3.0")).await;

    let mut config = pool("100.64.0.10", "100.64.0.20");
    config.interface = "X".into();
    let err = fleet
        .engine
        .apply(
            vec!["d1".into()],
            "dhcp",
            "ops",
            json!({ "action": "add", "dhcp": config }),
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(fleet.device("d1").await.dhcp.is_empty());
}

// ── Interface modify and routing filters ────────────────────────────

#[tokio::test]
async fn routing_filter_rules_follow_agent_version() {
    let fleet = Fleet::new().await;
    fleet.add_device(edge("old", "6.1.0")).await;
    fleet.add_device(edge("new", "6.2.0")).await;

    let outcome = fleet
        .apply("modify", &["old", "new"], json!({ "routingFilters": [filter()] }))
        .await;
    assert_eq!(outcome.ids.len(), 2);

    let jobs: Vec<_> = fleet.queue.snapshot().jobs;
    let old = jobs.iter().find(|j| j.device.as_str() == "old").unwrap();
    let new = jobs.iter().find(|j| j.device.as_str() == "new").unwrap();

    assert_eq!(
        params_of(old, "add-routing-filter")["rules"],
        json!([{ "route": "10.0.0.0/8" }])
    );
    assert_eq!(
        params_of(new, "add-routing-filter")["rules"],
        json!([
            { "route": "10.0.0.0/8", "action": "allow", "priority": 1 },
            { "route": "172.16.0.0/12", "action": "deny", "priority": 2 }
        ])
    );
}

#[tokio::test]
async fn lan_readdress_moves_dhcp_gateway() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(with_pool(edge("d1", "6.3.0"))).await;

    let outcome = fleet
        .apply(
            "modify",
            &["d1"],
            json!({ "interfaces": [{ "devId": "L", "ip": "192.168.7.2/24" }] }),
        )
        .await;
    let job = fleet.job(outcome.ids[0]).await;
    assert_eq!(
        messages(&job),
        vec!["modify-interface", "remove-dhcp-config", "add-dhcp-config"]
    );
    assert_eq!(params_of(&job, "remove-dhcp-config")["routers"], "192.168.1.2");
    assert_eq!(params_of(&job, "add-dhcp-config")["routers"], "192.168.7.2");

    fleet.complete(job.id).await;
    let dev = fleet.device("d1").await;
    assert_eq!(dev.state(Feature::Modify).status, FeatureStatus::Installed);
    assert_eq!(dev.interface("L").unwrap().ip.as_deref(), Some("192.168.7.2/24"));
}

#[tokio::test]
async fn deleted_modify_job_puts_the_address_back() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(edge("d1", "6.3.0")).await;

    let outcome = fleet
        .apply(
            "modify",
            &["d1"],
            json!({ "interfaces": [{ "devId": "X", "gateway": "100.64.0.254" }] }),
        )
        .await;
    assert_eq!(
        fleet.device("d1").await.interface("X").unwrap().gateway.as_deref(),
        Some("100.64.0.254")
    );

    fleet.remove(outcome.ids[0]).await;
    let dev = fleet.device("d1").await;
    assert_eq!(dev.interface("X").unwrap().gateway.as_deref(), Some("100.64.0.1"));
    assert_eq!(dev.state(Feature::Modify).status, FeatureStatus::JobDeleted);
}

// ── VRRP ────────────────────────────────────────────────────────────

#[tokio::test]
async fn vrrp_join_then_leave_moves_dhcp_gateway() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(with_pool(edge("d1", "6.3.0"))).await;
    fleet.add_device(with_pool(edge("d2", "6.3.0"))).await;
    fleet.add_policy(group(vec![member("d1", 200), member("d2", 100)]));

    let joined = fleet
        .apply("vrrp", &[], json!({ "action": "install", "group": "G1" }))
        .await;
    assert_eq!(joined.ids.len(), 2);
    let job = fleet.job(joined.ids[0]).await;
    assert_eq!(
        messages(&job),
        vec!["add-vrrp-group", "remove-dhcp-config", "add-dhcp-config"]
    );
    assert_eq!(params_of(&job, "add-vrrp-group")["virtualRouterId"], 12);
    assert_eq!(params_of(&job, "add-dhcp-config")["routers"], "192.168.1.1");
    for id in joined.ids {
        fleet.complete(id).await;
    }
    let group_id = PolicyId::from("G1");
    assert_eq!(
        fleet.device("d2").await.vrrp[&group_id].state.status,
        FeatureStatus::Installed
    );

    fleet.add_policy(group(vec![member("d1", 200)]));
    let reshaped = fleet
        .apply("vrrp", &[], json!({ "action": "install", "group": "G1" }))
        .await;
    assert_eq!(reshaped.ids.len(), 1);
    assert_eq!(reshaped.skipped, vec![DeviceId::from("d1")]);
    let leave = fleet.queue.snapshot().jobs;
    let leave = leave.iter().find(|j| j.device.as_str() == "d2").unwrap();
    assert_eq!(
        messages(leave),
        vec!["remove-vrrp-group", "remove-dhcp-config", "add-dhcp-config"]
    );
    assert_eq!(params_of(leave, "add-dhcp-config")["routers"], "192.168.1.2");

    fleet.complete(leave.id).await;
    assert!(fleet.device("d2").await.vrrp.is_empty());
}

#[tokio::test]
async fn reapplying_an_unchanged_vrrp_group_queues_nothing() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(with_pool(edge("d1", "6.3.0"))).await;
    fleet.add_policy(group(vec![member("d1", 200)]));

    let first = fleet
        .apply("vrrp", &["d1"], json!({ "action": "install", "group": "G1" }))
        .await;
    fleet.complete(first.ids[0]).await;

    let again = fleet
        .apply("vrrp", &["d1"], json!({ "action": "install", "group": "G1" }))
        .await;
    assert!(again.ids.is_empty());
    assert_eq!(again.skipped, vec![DeviceId::from("d1")]);
    assert!(fleet.queue.snapshot().jobs.is_empty());

    fleet.add_policy(group(vec![member("d1", 250)]));
    let reprioritised = fleet
        .apply("vrrp", &["d1"], json!({ "action": "install", "group": "G1" }))
        .await;
    let job = fleet.job(reprioritised.ids[0]).await;
    assert_eq!(messages(&job), vec!["add-vrrp-group"]);
    assert_eq!(params_of(&job, "add-vrrp-group")["priority"], 250);
}

#[tokio::test]
async fn vrrp_needs_a_recent_agent() {
    let fleet = Fleet::new().await;
    fleet.add_device(edge("d1", "6.0.4")).await;
    fleet.add_policy(group(vec![member("d1", 200)]));

    let err = fleet
        .engine
        .apply(
            vec!["d1".into()],
            "vrrp",
            "ops",
            json!({ "action": "install", "group": "G1" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unsupported { .. }));
}

// ── Upgrade ─────────────────────────────────────────────────────────

#[tokio::test]
async fn upgrade_completion_records_new_agent_version() {
    let mut fleet = Fleet::new().await;
    fleet.add_device(edge("d1", "6.2.0")).await;
    fleet.add_device(edge("d2", "6.4.0")).await;

    let outcome = fleet
        .apply("upgrade", &["d1", "d2"], json!({ "version": "6.4.0" }))
        .await;
    assert_eq!(outcome.ids.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);

    fleet.complete(outcome.ids[0]).await;
    let dev = fleet.device("d1").await;
    assert_eq!(dev.upgrade.status, FeatureStatus::Installed);
    assert_eq!(dev.versions.agent.as_deref(), Some("6.4.0"));
}
