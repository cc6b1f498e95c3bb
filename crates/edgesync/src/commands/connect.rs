//! `connect` handler: a device (re)joined the fleet.
//!
//! Without `--live` the connection report comes from the flags, with
//! unspecified versions taken from what the store last recorded.

use edgesync_core::{ConnectionInfo, DeviceId, MemoryRegistry};

use crate::cli::{ConnectArgs, GlobalOpts};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

use super::util;

pub async fn handle(
    fleet: &Fleet,
    local: &MemoryRegistry,
    args: ConnectArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let device = DeviceId::from(args.device.as_str());

    if !args.live {
        let stored = util::require_device(fleet, &args.device).await?;
        let mut versions = stored.versions;
        if let Some(agent) = args.agent_version {
            versions.agent = Some(agent);
        }
        local.connect(ConnectionInfo {
            device: device.clone(),
            connected: true,
            versions,
            sync_hash: args.hash,
        });
    }

    let job = fleet.engine.device_connected(&device).await?;
    match job {
        Some(id) => output::print_output(&id.to_string(), global.quiet),
        None if !global.quiet => eprintln!("{device} is already in sync"),
        None => {}
    }
    Ok(())
}
