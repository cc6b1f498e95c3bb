use thiserror::Error;

/// Top-level error type for the `edgesync-api` crate.
///
/// Covers every failure mode of the registry surface: credentials,
/// transport, structured registry errors and agent-side rejections.
/// `edgesync-core` maps these into engine errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// API key rejected by the registry.
    #[error("Invalid registry API key")]
    InvalidApiKey,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS setup or client construction failed.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Registry ────────────────────────────────────────────────────
    /// Structured error returned by the registry.
    #[error("Registry error (HTTP {status}): {message}")]
    Registry {
        message: String,
        code: Option<String>,
        status: u16,
    },

    /// The device has no live connection to the registry.
    #[error("Device {device} is not connected")]
    DeviceOffline { device: String },

    // ── Agent ───────────────────────────────────────────────────────
    /// The agent received the request and reported a failure.
    #[error("Agent on {device} rejected {message_name}: {reason}")]
    AgentRejected {
        device: String,
        message_name: String,
        reason: String,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::DeviceOffline { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Registry { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Extract the registry error code, if available.
    pub fn api_error_code(&self) -> Option<&str> {
        match self {
            Self::Registry { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
