//! Clap derive structures for the `edgesync` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use edgesync_core::JobId;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// edgesync -- push configuration jobs to an SD-WAN device fleet
#[derive(Debug, Parser)]
#[command(
    name = "edgesync",
    version,
    about = "Orchestrate configuration jobs across SD-WAN edge devices",
    long_about = "Applies QoS, firewall, DHCP, routing, VRRP and upgrade changes to\n\
        many devices at once, tracks each device's feature state through the\n\
        job lifecycle, and rebuilds full device configuration on sync.\n\n\
        Fleet state lives in a local JSON file (--state).",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "EDGESYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Fleet state file
    #[arg(
        long,
        env = "EDGESYNC_STATE",
        default_value = "fleet-state.json",
        global = true
    )]
    pub state: PathBuf,

    /// User recorded on queued jobs
    #[arg(long, env = "EDGESYNC_USER", default_value = "cli", global = true)]
    pub user: String,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "EDGESYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output Enum ──────────────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect and import devices
    #[command(alias = "dev", alias = "d")]
    Devices(DevicesArgs),

    /// Inspect and import policy documents
    #[command(alias = "pol")]
    Policies(PoliciesArgs),

    /// Apply a feature method to devices
    Apply(ApplyArgs),

    /// Inspect queued jobs and report device outcomes
    Jobs(JobsArgs),

    /// Request a full configuration sync for a device
    Sync(SyncArgs),

    /// Handle a device (re)connecting to the fleet
    Connect(ConnectArgs),

    /// Inspect CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  DEVICES
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct DevicesArgs {
    #[command(subcommand)]
    pub command: DevicesCommand,
}

#[derive(Debug, Subcommand)]
pub enum DevicesCommand {
    /// List devices
    #[command(alias = "ls")]
    List,

    /// Show a device with its feature states
    Show {
        /// Device ID
        device: String,
    },

    /// Import devices from a JSON file (one object or an array)
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Fetch the live router configuration through the registry
    Config {
        /// Device ID
        device: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  POLICIES
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct PoliciesArgs {
    #[command(subcommand)]
    pub command: PoliciesCommand,
}

#[derive(Debug, Subcommand)]
pub enum PoliciesCommand {
    /// List stored policy documents
    #[command(alias = "ls")]
    List,

    /// Import policy documents from a JSON file (one object or an array)
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  APPLY
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Method name (qosPolicy, dhcp, vrrp, sync, upgrade, ...)
    pub method: String,

    /// Target device IDs, comma separated
    #[arg(long, short = 'd', value_delimiter = ',')]
    pub devices: Vec<String>,

    /// Request data as inline JSON
    #[arg(long, conflicts_with = "from_file")]
    pub data: Option<String>,

    /// Read request data from a JSON file
    #[arg(long, short = 'F')]
    pub from_file: Option<PathBuf>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  JOBS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommand,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List jobs held by the queue
    #[command(alias = "ls")]
    List {
        /// Only jobs addressed to this device
        #[arg(long)]
        device: Option<String>,
    },

    /// Show a job with its flattened tasks
    Show {
        /// Job ID
        id: JobId,
    },

    /// Report that the device applied the job
    Complete {
        /// Job ID
        id: JobId,

        /// Device reply as JSON
        #[arg(long)]
        result: Option<String>,
    },

    /// Report that the device rejected the job
    Fail {
        /// Job ID
        id: JobId,

        /// Failure reason reported by the device
        #[arg(long)]
        reason: String,
    },

    /// Delete a job before the device confirms it
    #[command(alias = "rm")]
    Remove {
        /// Job ID
        id: JobId,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SYNC / CONNECT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Device ID
    pub device: String,

    /// Sync even when the desired configuration is unchanged
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Device ID
    pub device: String,

    /// Configuration fingerprint reported by the device
    #[arg(long)]
    pub hash: Option<String>,

    /// Agent version reported by the device
    #[arg(long)]
    pub agent_version: Option<String>,

    /// Look the connection up in the configured registry instead
    #[arg(long, conflicts_with_all = ["hash", "agent_version"])]
    pub live: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG / COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the resolved configuration
    Show,

    /// Print the config file path
    Path,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
