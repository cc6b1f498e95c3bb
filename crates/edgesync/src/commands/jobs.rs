//! Job command handlers.
//!
//! `complete`, `fail` and `remove` stand in for the device's reply: they
//! move the job through the queue, and the dispatcher settles device
//! state before the fleet is saved.

use chrono::SecondsFormat;
use tabled::Tabled;

use edgesync_core::{Job, JobQueue};

use crate::cli::{GlobalOpts, JobsArgs, JobsCommand};
use crate::error::CliError;
use crate::fleet::Fleet;
use crate::output;

use super::util;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Method")]
    method: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Tasks")]
    tasks: usize,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&Job> for JobRow {
    fn from(j: &Job) -> Self {
        Self {
            id: j.id.get(),
            device: j.device.to_string(),
            method: j.meta.method.clone(),
            state: j.state.to_string(),
            tasks: j.flat_tasks().len(),
            user: j.user.clone(),
            created: j.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn detail(j: &Job) -> String {
    let mut lines = vec![
        format!("ID:      {}", j.id),
        format!("Title:   {}", j.title),
        format!("Device:  {}", j.device),
        format!("Org:     {}", j.org),
        format!("Method:  {}", j.meta.method),
        format!("State:   {}", j.state),
        format!("User:    {}", j.user),
        format!("Created: {}", j.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        format!("Options: priority={} attempts={}", j.options.priority, j.options.attempts),
    ];
    if let Some(ref err) = j.error {
        lines.push(format!("Error:   {err}"));
    }
    lines.push("Tasks:".into());
    for (n, task) in j.flat_tasks().iter().enumerate() {
        lines.push(format!("  {:>2}. {}", n + 1, task.message));
    }
    lines.join("\n")
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(fleet: &Fleet, args: JobsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        JobsCommand::List { device } => {
            let jobs: Vec<Job> = fleet
                .queue
                .jobs()
                .await?
                .into_iter()
                .filter(|j| device.as_deref().is_none_or(|d| j.device.as_str() == d))
                .collect();
            let out = output::render_list(
                &global.output,
                &jobs,
                |j| JobRow::from(j),
                |j| j.id.to_string(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        JobsCommand::Show { id } => {
            let job = fleet.queue.job(id).await?.ok_or_else(|| CliError::NotFound {
                resource_type: "job".into(),
                identifier: id.to_string(),
                list_command: "jobs list".into(),
            })?;
            let out = output::render_single(&global.output, &job, detail, |j| j.id.to_string());
            output::print_output(&out, global.quiet);
            Ok(())
        }

        JobsCommand::Complete { id, result } => {
            let result = match result {
                Some(raw) => util::parse_json_arg("result", &raw)?,
                None => serde_json::Value::Null,
            };
            let job = fleet.queue.complete(id, result)?;
            if !global.quiet {
                eprintln!("Job {id} completed on {}", job.device);
            }
            Ok(())
        }

        JobsCommand::Fail { id, reason } => {
            let job = fleet.queue.fail(id, &reason)?;
            if !global.quiet {
                eprintln!("Job {id} failed on {}", job.device);
            }
            Ok(())
        }

        JobsCommand::Remove { id } => {
            fleet.queue.remove(id)?;
            if !global.quiet {
                eprintln!("Job {id} removed");
            }
            Ok(())
        }
    }
}
