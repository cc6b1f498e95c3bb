#![allow(clippy::unwrap_used)]
// Integration tests for full-device sync and connect handling.

mod common;

use pretty_assertions::assert_eq;

use common::{Fleet, edge, messages};
use edgesync_core::model::{
    DeviceVersions, DhcpConfig, DhcpEntry, FeatureState, StaticRoute, StaticRouteEntry,
};
use edgesync_core::{ConnectionInfo, Device, DeviceId, FeatureStatus, SyncStatus};

// ── Helpers ─────────────────────────────────────────────────────────

fn installed() -> FeatureState {
    FeatureState {
        status: FeatureStatus::Installed,
        ..FeatureState::default()
    }
}

fn configured_edge(id: &str) -> Device {
    let mut dev = edge(id, "6.3.0");
    dev.dhcp.push(DhcpEntry {
        config: DhcpConfig {
            id: "lan-pool".into(),
            interface: "L".into(),
            range_start: "192.168.1.10".into(),
            range_end: "192.168.1.100".into(),
            dns: vec!["1.1.1.1".into()],
            mac_assign: Vec::new(),
            options: Vec::new(),
        },
        state: installed(),
    });
    dev.static_routes.push(StaticRouteEntry {
        route: StaticRoute {
            id: "to-dc".into(),
            destination: "10.20.0.0/16".into(),
            gateway: "100.64.0.1".into(),
            interface: None,
            metric: None,
            redistribute_via_ospf: false,
            redistribute_via_bgp: false,
            on_link: false,
        },
        state: installed(),
    });
    dev
}

async fn fleet() -> Fleet {
    let fleet = Fleet::new().await;
    fleet.add_device(configured_edge("d1")).await;
    fleet
}

fn online(id: &str, agent: &str, hash: Option<String>) -> ConnectionInfo {
    ConnectionInfo {
        device: DeviceId::from(id),
        connected: true,
        versions: DeviceVersions {
            agent: Some(agent.into()),
            ..DeviceVersions::default()
        },
        sync_hash: hash,
    }
}

/// Sync `d1` once and confirm it, returning the fingerprint.
async fn synced(fleet: &mut Fleet) -> String {
    let job = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap()
        .unwrap();
    fleet.complete(job).await;
    fleet.device("d1").await.sync.hash.unwrap()
}

// ── Sync requests ───────────────────────────────────────────────────

#[tokio::test]
async fn sync_job_concatenates_modules_in_order() {
    let fleet = fleet().await;
    let job = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap()
        .unwrap();

    let job = fleet.job(job).await;
    assert_eq!(job.meta.method, "sync");
    assert_eq!(job.user, "system");
    assert_eq!(
        messages(&job),
        vec![
            "modify-interface",
            "modify-interface",
            "modify-interface",
            "add-route",
            "add-dhcp-config",
        ]
    );
    let dev = fleet.device("d1").await;
    assert_eq!(dev.sync.status, SyncStatus::SyncInFlight);
    assert_eq!(dev.sync.job, Some(job.id));
}

#[tokio::test]
async fn unchanged_device_is_not_synced_twice() {
    let mut fleet = fleet().await;
    let first = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap();
    assert!(first.is_some());

    let in_flight = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap();
    assert_eq!(in_flight, None);

    fleet.complete(first.unwrap()).await;
    assert_eq!(
        fleet.device("d1").await.sync.status,
        SyncStatus::SyncConfirmed
    );
    let confirmed = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap();
    assert_eq!(confirmed, None);

    let forced = fleet.engine.request_sync(&"d1".into(), true).await.unwrap();
    assert!(forced.is_some());
}

#[tokio::test]
async fn superseded_sync_completion_is_ignored() {
    let mut fleet = fleet().await;
    let first = fleet
        .engine
        .request_sync(&"d1".into(), true)
        .await
        .unwrap()
        .unwrap();
    let second = fleet
        .engine
        .request_sync(&"d1".into(), true)
        .await
        .unwrap()
        .unwrap();

    fleet.complete(first).await;
    let dev = fleet.device("d1").await;
    assert_eq!(dev.sync.status, SyncStatus::SyncInFlight);
    assert_eq!(dev.sync.job, Some(second));

    fleet.complete(second).await;
    assert_eq!(
        fleet.device("d1").await.sync.status,
        SyncStatus::SyncConfirmed
    );
}

#[tokio::test]
async fn failed_sync_is_recorded_and_retried() {
    let mut fleet = fleet().await;
    let job = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap()
        .unwrap();

    fleet.fail(job, "agent busy").await;
    assert_eq!(fleet.device("d1").await.sync.status, SyncStatus::SyncFailed);

    let retry = fleet
        .engine
        .request_sync(&"d1".into(), false)
        .await
        .unwrap();
    assert!(retry.is_some());
}

#[tokio::test]
async fn sync_apply_fans_out_over_devices() {
    let fleet = fleet().await;
    fleet.add_device(configured_edge("d2")).await;

    let outcome = fleet
        .apply("sync", &["d1", "d2", "d1"], serde_json::Value::Null)
        .await;
    assert_eq!(outcome.ids.len(), 2);
    assert!(outcome.failed.is_empty());
}

#[tokio::test]
async fn sync_confirmation_drops_confirmed_removals() {
    let mut fleet = fleet().await;
    let mut dev = fleet.device("d1").await;
    dev.static_routes[0].state.status = FeatureStatus::Uninstalling;
    fleet.store.insert_device(dev);

    synced(&mut fleet).await;
    let dev = fleet.device("d1").await;
    assert!(dev.static_routes.is_empty());
    assert_eq!(dev.dhcp.len(), 1);
}

// ── Device connect ──────────────────────────────────────────────────

#[tokio::test]
async fn matching_fingerprint_on_connect_needs_no_job() {
    let mut fleet = fleet().await;
    let hash = synced(&mut fleet).await;
    let queued = fleet.queue.snapshot().jobs.len();

    fleet.registry.connect(online("d1", "6.3.0", Some(hash)));
    let job = fleet.engine.device_connected(&"d1".into()).await.unwrap();

    assert_eq!(job, None);
    assert_eq!(fleet.queue.snapshot().jobs.len(), queued);
    assert_eq!(
        fleet.device("d1").await.sync.status,
        SyncStatus::SyncConfirmed
    );
}

#[tokio::test]
async fn stale_fingerprint_on_connect_forces_a_sync() {
    let mut fleet = fleet().await;
    synced(&mut fleet).await;

    fleet
        .registry
        .connect(online("d1", "6.3.0", Some("0000".into())));
    let job = fleet.engine.device_connected(&"d1".into()).await.unwrap();

    assert!(job.is_some());
    assert_eq!(fleet.device("d1").await.sync.status, SyncStatus::SyncInFlight);
}

#[tokio::test]
async fn connect_records_reported_versions() {
    let fleet = fleet().await;
    fleet.registry.connect(online("d1", "6.4.1", None));

    fleet.engine.device_connected(&"d1".into()).await.unwrap();
    let dev = fleet.device("d1").await;
    assert_eq!(dev.versions.agent.as_deref(), Some("6.4.1"));
}
