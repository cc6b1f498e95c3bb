//! `apply` handler: one method over many devices.

use serde_json::Value;

use edgesync_core::{ApplyOutcome, ApplyStatus, DeviceId};

use crate::cli::{ApplyArgs, GlobalOpts};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

use super::util;

fn detail(o: &ApplyOutcome) -> String {
    let ids: Vec<String> = o.ids.iter().map(ToString::to_string).collect();
    let mut lines = vec![
        format!("Status:  {}", o.status),
        format!(
            "Jobs:    {}",
            if ids.is_empty() { "-".into() } else { ids.join(", ") }
        ),
    ];
    if !o.skipped.is_empty() {
        let skipped: Vec<&str> = o.skipped.iter().map(DeviceId::as_str).collect();
        lines.push(format!("Skipped: {}", skipped.join(", ")));
    }
    for f in &o.failed {
        lines.push(format!("Failed:  {} ({})", f.device, f.reason));
    }
    if !o.message.is_empty() {
        lines.push(format!("Message: {}", o.message));
    }
    lines.join("\n")
}

pub async fn handle(fleet: &Fleet, args: ApplyArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let data = match (&args.data, &args.from_file) {
        (Some(raw), _) => util::parse_json_arg("data", raw)?,
        (None, Some(path)) => util::read_json_file(path)?,
        (None, None) => Value::Null,
    };
    let devices: Vec<DeviceId> = args
        .devices
        .iter()
        .filter(|d| !d.is_empty())
        .map(|d| DeviceId::from(d.as_str()))
        .collect();

    let outcome = fleet
        .engine
        .apply(devices, &args.method, &global.user, data)
        .await?;

    let out = output::render_single(&global.output, &outcome, detail, |o| {
        o.ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    });
    output::print_output(&out, global.quiet);

    if outcome.status == ApplyStatus::Failed {
        return Err(CliError::ApplyFailed {
            method: args.method,
        });
    }
    Ok(())
}
