//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors
//! with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use edgesync_config::ConfigError;
use edgesync_core::queue::QueueError;
use edgesync_core::store::StoreError;
use edgesync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Registry ─────────────────────────────────────────────────────
    #[error("No device registry configured")]
    #[diagnostic(
        code(edgesync::no_registry),
        help(
            "Set registry.url in {path}\n\
             Or export EDGESYNC_REGISTRY__URL."
        )
    )]
    NoRegistry { path: String },

    #[error("No API key configured for the device registry")]
    #[diagnostic(
        code(edgesync::no_credentials),
        help(
            "Set registry.api_key_env to the name of a variable holding the key,\n\
             or store it in the system keyring under edgesync/registry-api-key."
        )
    )]
    NoCredentials,

    #[error("Device {device} is not connected")]
    #[diagnostic(
        code(edgesync::device_unreachable),
        help("Check the device's connection to the registry and try again.")
    )]
    DeviceUnreachable { device: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(edgesync::not_found),
        help("Run: edgesync {list_command} to see what is available")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("{message}")]
    #[diagnostic(
        code(edgesync::conflict),
        help("Re-read the current state with `edgesync jobs show` or `edgesync devices show`.")
    )]
    Conflict { message: String },

    // ── Engine ───────────────────────────────────────────────────────
    #[error("{feature} is not supported on device {device} (agent {version})")]
    #[diagnostic(
        code(edgesync::unsupported),
        help("Upgrade the device agent to {required} or later: edgesync apply upgrade -d {device}")
    )]
    Unsupported {
        feature: String,
        device: String,
        version: String,
        required: String,
    },

    #[error("Apply of '{method}' failed on every device")]
    #[diagnostic(code(edgesync::apply_failed))]
    ApplyFailed { method: String },

    #[error("Device agent error: {message}")]
    #[diagnostic(code(edgesync::agent))]
    Agent { message: String },

    #[error("Engine error: {message}")]
    #[diagnostic(code(edgesync::engine))]
    Engine { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(edgesync::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(edgesync::config),
        help("Run: edgesync config path to locate the config file")
    )]
    Config { message: String },

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Device request timed out after {seconds}s")]
    #[diagnostic(
        code(edgesync::timeout),
        help("Raise engine.device_request_timeout_secs or check the device's responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(code(edgesync::json), help("Check the JSON contents and try again."))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeviceUnreachable { .. } => exit_code::CONNECTION,
            Self::NoCredentials => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Unsupported { .. } => exit_code::PERMISSION,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownMethod { method } => CliError::Validation {
                field: "method".into(),
                reason: format!("unknown method '{method}'"),
            },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "data".into(),
                reason: message,
            },

            CoreError::Unsupported {
                feature,
                device,
                version,
                required,
            } => CliError::Unsupported {
                feature,
                device,
                version,
                required,
            },

            CoreError::DeviceNotFound { device } => CliError::NotFound {
                resource_type: "device".into(),
                identifier: device,
                list_command: "devices list".into(),
            },

            CoreError::Store(StoreError::Missing(device)) => CliError::NotFound {
                resource_type: "device".into(),
                identifier: device.to_string(),
                list_command: "devices list".into(),
            },

            CoreError::PolicyNotFound { kind, id } => CliError::NotFound {
                resource_type: kind,
                identifier: id,
                list_command: "policies list".into(),
            },

            CoreError::Queue(QueueError::NotFound(id)) => CliError::NotFound {
                resource_type: "job".into(),
                identifier: id.to_string(),
                list_command: "jobs list".into(),
            },

            CoreError::Queue(err @ QueueError::InvalidState { .. }) => CliError::Conflict {
                message: err.to_string(),
            },

            CoreError::Store(err @ StoreError::Conflict { .. }) => CliError::Conflict {
                message: err.to_string(),
            },

            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::DeviceUnreachable { device } => CliError::DeviceUnreachable { device },

            CoreError::Agent { message } => CliError::Agent { message },

            other @ (CoreError::DuplicateMethod { .. }
            | CoreError::Store(_)
            | CoreError::Queue(_)
            | CoreError::Internal(_)) => CliError::Engine {
                message: other.to_string(),
            },
        }
    }
}

impl From<QueueError> for CliError {
    fn from(err: QueueError) -> Self {
        CoreError::Queue(err).into()
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoCredentials => CliError::NoCredentials,
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}
