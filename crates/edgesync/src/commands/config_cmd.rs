//! Config subcommand handlers.

use std::fmt::Write as _;

use edgesync_config::{Config, LogFormat};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::util;

/// Format config for display, masking the API key.
fn format_config_redacted(cfg: &Config) -> String {
    let mut out = String::new();
    let e = &cfg.engine;
    let _ = writeln!(out, "[engine]");
    let _ = writeln!(out, "fanout_concurrency = {}", e.fanout_concurrency);
    let _ = writeln!(out, "job_priority = \"{}\"", e.job_priority);
    let _ = writeln!(out, "job_attempts = {}", e.job_attempts);
    let _ = writeln!(out, "remove_on_complete = {}", e.remove_on_complete);
    let _ = writeln!(
        out,
        "device_request_timeout_secs = {}",
        e.device_request_timeout_secs
    );
    let _ = writeln!(out, "store_retry_limit = {}", e.store_retry_limit);

    let r = &cfg.registry;
    let _ = writeln!(out);
    let _ = writeln!(out, "[registry]");
    if let Some(ref url) = r.url {
        let _ = writeln!(out, "url = \"{url}\"");
    }
    if r.api_key.is_some() {
        let _ = writeln!(out, "api_key = \"****\"");
    }
    if let Some(ref env) = r.api_key_env {
        let _ = writeln!(out, "api_key_env = \"{env}\"");
    }
    let _ = writeln!(out, "timeout_secs = {}", r.timeout_secs);
    if let Some(ref ca) = r.ca_cert {
        let _ = writeln!(out, "ca_cert = \"{}\"", ca.display());
    }
    let _ = writeln!(out, "insecure = {}", r.insecure);

    let l = &cfg.logging;
    let _ = writeln!(out);
    let _ = writeln!(out, "[logging]");
    if let Some(ref level) = l.level {
        let _ = writeln!(out, "level = \"{level}\"");
    }
    let format = match l.format {
        LogFormat::Text => "text",
        LogFormat::Json => "json",
    };
    let _ = writeln!(out, "format = \"{format}\"");

    out
}

pub fn handle(args: ConfigArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let out = format_config_redacted(cfg);
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            let path = util::config_file(global);
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }
    }
}
