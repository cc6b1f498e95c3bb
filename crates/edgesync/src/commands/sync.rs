//! `sync` handler.

use edgesync_core::DeviceId;

use crate::cli::{GlobalOpts, SyncArgs};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

pub async fn handle(fleet: &Fleet, args: SyncArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let device = DeviceId::from(args.device.as_str());
    let job = fleet.engine.request_sync(&device, args.force).await?;
    match job {
        Some(id) => output::print_output(&id.to_string(), global.quiet),
        None if !global.quiet => eprintln!("{device} is already in sync"),
        None => {}
    }
    Ok(())
}
