// ── Core error types ──
//
// Errors surfaced by the engine. Transport details from the registry
// client are translated by the `From<edgesync_api::Error>` impl so
// callers never match on HTTP codes.

use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Caller errors (rejected before anything is queued) ──────────
    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Method registered twice: {method}")]
    DuplicateMethod { method: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("{feature} is not supported on device {device} (agent {version}, requires {required})")]
    Unsupported {
        feature: String,
        device: String,
        version: String,
        required: String,
    },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("{kind} not found: {id}")]
    PolicyNotFound { kind: String, id: String },

    // ── Collaborator errors ─────────────────────────────────────────
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    // ── Device round-trips ──────────────────────────────────────────
    #[error("Device request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Device {device} is not connected")]
    DeviceUnreachable { device: String },

    #[error("Agent error: {message}")]
    Agent { message: String },

    // ── Internal errors ─────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Caller-side mistakes (4xx-equivalent). Never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownMethod { .. }
                | Self::ValidationFailed { .. }
                | Self::Unsupported { .. }
                | Self::DeviceNotFound { .. }
                | Self::PolicyNotFound { .. }
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    pub(crate) fn policy_not_found(kind: &str, id: impl ToString) -> Self {
        Self::PolicyNotFound {
            kind: kind.to_owned(),
            id: id.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<edgesync_api::Error> for CoreError {
    fn from(err: edgesync_api::Error) -> Self {
        match err {
            edgesync_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            edgesync_api::Error::DeviceOffline { device } => CoreError::DeviceUnreachable { device },
            edgesync_api::Error::AgentRejected {
                device,
                message_name,
                reason,
            } => CoreError::Agent {
                message: format!("{device} rejected {message_name}: {reason}"),
            },
            edgesync_api::Error::Registry { status: 404, .. } => CoreError::DeviceNotFound {
                device: String::new(),
            },
            edgesync_api::Error::Transport(ref e) if e.is_timeout() => {
                CoreError::Timeout { timeout_secs: 0 }
            }
            other => CoreError::Internal(format!("registry: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_classification() {
        assert!(
            CoreError::UnknownMethod {
                method: "bogus".into()
            }
            .is_validation()
        );
        assert!(!CoreError::Timeout { timeout_secs: 3 }.is_validation());
        assert!(!CoreError::Internal("x".into()).is_validation());
    }

    #[test]
    fn api_errors_translate() {
        let err: CoreError = edgesync_api::Error::DeviceOffline {
            device: "d1".into(),
        }
        .into();
        assert!(matches!(err, CoreError::DeviceUnreachable { ref device } if device == "d1"));

        let err: CoreError = edgesync_api::Error::Timeout { timeout_secs: 5 }.into();
        assert!(matches!(err, CoreError::Timeout { timeout_secs: 5 }));
    }
}
