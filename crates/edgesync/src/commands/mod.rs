//! Command dispatch: bridges CLI args -> engine operations -> output formatting.

pub mod apply;
pub mod config_cmd;
pub mod connect;
pub mod devices;
pub mod jobs;
pub mod policies;
pub mod sync;
pub mod util;

use std::sync::Arc;

use edgesync_config::Config;
use edgesync_core::{DeviceRegistry, MemoryRegistry};

use crate::cli::{Command, DevicesCommand, GlobalOpts};
use crate::error::CliError;
use crate::fleet::{self, Fleet};

/// Dispatch a fleet-bound command to the appropriate handler.
///
/// The fleet is saved whether or not the handler succeeds.
pub async fn dispatch(cmd: Command, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let local = Arc::new(MemoryRegistry::new());
    let registry: Arc<dyn DeviceRegistry> = if needs_live_registry(&cmd) {
        let path = util::config_file(global);
        fleet::live_registry(cfg, &path)?
    } else {
        Arc::clone(&local) as Arc<dyn DeviceRegistry>
    };

    let fleet = Fleet::open(global.state.clone(), cfg, registry).await?;
    tracing::debug!(command = ?cmd, "dispatching command");

    let result = match cmd {
        Command::Devices(args) => devices::handle(&fleet, args, global).await,
        Command::Policies(args) => policies::handle(&fleet, args, global).await,
        Command::Apply(args) => apply::handle(&fleet, args, global).await,
        Command::Jobs(args) => jobs::handle(&fleet, args, global).await,
        Command::Sync(args) => sync::handle(&fleet, args, global).await,
        Command::Connect(args) => connect::handle(&fleet, &local, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => unreachable!(),
    };

    fleet.close().await?;
    result
}

fn needs_live_registry(cmd: &Command) -> bool {
    match cmd {
        Command::Devices(args) => matches!(args.command, DevicesCommand::Config { .. }),
        Command::Connect(args) => args.live,
        _ => false,
    }
}
