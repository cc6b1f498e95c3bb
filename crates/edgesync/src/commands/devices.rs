//! Device command handlers.

use std::fmt::Write as _;

use tabled::Tabled;

use edgesync_core::{CoreError, Device, DeviceId, FeatureState, FeatureStatus, Store};

use crate::cli::{DevicesArgs, DevicesCommand, GlobalOpts};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

use super::util;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Org")]
    org: String,
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Sync")]
    sync: String,
    #[tabled(rename = "Pending")]
    pending: usize,
}

impl From<&Device> for DeviceRow {
    fn from(d: &Device) -> Self {
        Self {
            id: d.id.to_string(),
            name: d.name.clone(),
            org: d.org.to_string(),
            agent: util::or_dash(d.versions.agent.as_deref()).to_owned(),
            sync: d.sync.status.to_string(),
            pending: pending_transitions(d),
        }
    }
}

/// Feature transitions still waiting on a job.
fn pending_transitions(d: &Device) -> usize {
    let singletons = d.features.values().filter(|s| s.status.in_transition());
    let dhcp = d.dhcp.iter().filter(|e| e.state.status.in_transition());
    let routes = d
        .static_routes
        .iter()
        .filter(|e| e.state.status.in_transition());
    let vrrp = d.vrrp.values().filter(|m| m.state.status.in_transition());
    singletons.count()
        + dhcp.count()
        + routes.count()
        + vrrp.count()
        + usize::from(d.upgrade.status.in_transition())
}

fn state_line(state: &FeatureState) -> String {
    let mut line = state.status.to_string();
    if let Some(ref policy) = state.policy {
        let _ = write!(line, " policy={policy}");
    }
    if let Some(rev) = state.revision {
        let _ = write!(line, " rev={rev}");
    }
    line
}

fn detail(d: &Device) -> String {
    let mut lines = vec![
        format!("ID:       {}", d.id),
        format!("Name:     {}", if d.name.is_empty() { "-" } else { &d.name }),
        format!("Org:      {}", d.org),
        format!("Approved: {}", d.approved),
        format!("Agent:    {}", util::or_dash(d.versions.agent.as_deref())),
        format!("Router:   {}", util::or_dash(d.versions.router.as_deref())),
        format!("Firmware: {}", util::or_dash(d.versions.firmware.as_deref())),
        format!("Revision: {}", d.revision),
        format!(
            "Sync:     {}{}",
            d.sync.status,
            d.sync.job.map(|j| format!(" (job {j})")).unwrap_or_default()
        ),
    ];

    if !d.interfaces.is_empty() {
        lines.push("Interfaces:".into());
        for i in &d.interfaces {
            lines.push(format!(
                "  {:<8} {:<4} {:<10} ip={} gw={}",
                i.dev_id,
                i.kind,
                i.name,
                util::or_dash(i.ip.as_deref()),
                util::or_dash(i.gateway.as_deref()),
            ));
        }
    }

    if !d.features.is_empty() {
        lines.push("Features:".into());
        for (feature, state) in &d.features {
            lines.push(format!("  {:<18} {}", feature.as_ref(), state_line(state)));
        }
    }

    for entry in &d.dhcp {
        lines.push(format!(
            "DHCP:     {} on {} {}-{} [{}]",
            entry.config.id,
            entry.config.interface,
            entry.config.range_start,
            entry.config.range_end,
            entry.state.status,
        ));
    }
    for entry in &d.static_routes {
        lines.push(format!(
            "Route:    {} {} via {} [{}]",
            entry.route.id, entry.route.destination, entry.route.gateway, entry.state.status,
        ));
    }
    for (group, m) in &d.vrrp {
        lines.push(format!(
            "VRRP:     {group} vrid={} vip={} on {} [{}]",
            m.virtual_router_id, m.virtual_ip, m.interface, m.state.status,
        ));
    }
    if d.upgrade.status != FeatureStatus::None {
        lines.push(format!(
            "Upgrade:  {} -> {}",
            d.upgrade.status,
            util::or_dash(d.upgrade.target.as_deref())
        ));
    }
    lines.join("\n")
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(fleet: &Fleet, args: DevicesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        DevicesCommand::List => {
            let mut devices = fleet.store.devices().await.map_err(CoreError::from)?;
            devices.sort_by(|a, b| a.id.cmp(&b.id));
            let out = output::render_list(
                &global.output,
                &devices,
                |d| DeviceRow::from(d),
                |d| d.id.to_string(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        DevicesCommand::Show { device } => {
            let d = util::require_device(fleet, &device).await?;
            let out = output::render_single(&global.output, &d, detail, |d| d.id.to_string());
            output::print_output(&out, global.quiet);
            Ok(())
        }

        DevicesCommand::Import { file } => {
            let devices: Vec<Device> = util::read_documents(&file)?;
            let count = devices.len();
            for device in devices {
                tracing::debug!(device = %device.id, "importing device");
                fleet
                    .store
                    .put_device(device)
                    .await
                    .map_err(CoreError::from)?;
            }
            if !global.quiet {
                eprintln!("Imported {count} device(s)");
            }
            Ok(())
        }

        DevicesCommand::Config { device } => {
            let config = fleet
                .engine
                .router_config(&DeviceId::from(device.as_str()))
                .await?;
            let out = output::render_single(
                &global.output,
                &config,
                |v| serde_json::to_string_pretty(v).unwrap_or_default(),
                |v| v.to_string(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_every_transition_kind() {
        let mut d = Device::new("d1", "o1");
        d.state_mut(edgesync_core::Feature::QosPolicy).status = FeatureStatus::Installing;
        d.state_mut(edgesync_core::Feature::Notifications).status = FeatureStatus::Installed;
        d.upgrade.status = FeatureStatus::Uninstalling;
        assert_eq!(pending_transitions(&d), 2);
    }

    #[test]
    fn detail_lists_feature_states() {
        let mut d = Device::new("d1", "o1");
        let state = d.state_mut(edgesync_core::Feature::QosTrafficMap);
        state.status = FeatureStatus::Installed;
        state.revision = Some(3);
        let text = detail(&d);
        assert!(text.contains("qosTrafficMap"));
        assert!(text.contains("installed rev=3"));
    }
}
