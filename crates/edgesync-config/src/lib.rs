//! Shared configuration for the edgesync CLI.
//!
//! TOML file plus `EDGESYNC_*` environment overrides, registry credential
//! resolution (env + keyring + plaintext), and translation to
//! `edgesync_core::EngineConfig` and an `edgesync_api::RegistryClient`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use edgesync_api::{RegistryClient, TlsMode, TransportConfig};
use edgesync_core::EngineConfig;
use edgesync_core::model::JobPriority;

/// Keyring service holding the registry API key.
pub const KEYRING_SERVICE: &str = "edgesync";
/// Keyring entry name of the registry API key.
pub const KEYRING_API_KEY: &str = "registry-api-key";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no API key configured for the device registry")]
    NoCredentials,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("registry client: {0}")]
    Registry(#[from] edgesync_api::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Job submission and device round-trip tuning.
#[derive(Debug, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default = "default_fanout")]
    pub fanout_concurrency: usize,

    #[serde(default)]
    pub job_priority: JobPriority,

    #[serde(default = "default_attempts")]
    pub job_attempts: u32,

    #[serde(default = "default_true")]
    pub remove_on_complete: bool,

    #[serde(default = "default_timeout")]
    pub device_request_timeout_secs: u64,

    #[serde(default = "default_retry_limit")]
    pub store_retry_limit: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            fanout_concurrency: default_fanout(),
            job_priority: JobPriority::default(),
            job_attempts: default_attempts(),
            remove_on_complete: true,
            device_request_timeout_secs: default_timeout(),
            store_retry_limit: default_retry_limit(),
        }
    }
}

fn default_fanout() -> usize {
    16
}
fn default_attempts() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}
fn default_retry_limit() -> u32 {
    5
}

/// Device connection registry endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RegistrySection {
    /// Registry base URL (e.g., "https://registry.example.net/api").
    pub url: Option<String>,

    /// API key (plaintext, prefer keyring or env var).
    pub api_key: Option<String>,

    /// Environment variable name containing the API key.
    pub api_key_env: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            api_key_env: None,
            timeout_secs: default_timeout(),
            ca_cert: None,
            insecure: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `-v` is not given.
    pub level: Option<String>,

    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// Engine settings, validated.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let e = &self.engine;
        if e.fanout_concurrency == 0 {
            return Err(ConfigError::Validation {
                field: "engine.fanout_concurrency".into(),
                reason: "must be at least 1".into(),
            });
        }
        if e.job_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "engine.job_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(EngineConfig {
            fanout_concurrency: e.fanout_concurrency,
            job_priority: e.job_priority,
            job_attempts: e.job_attempts,
            remove_on_complete: e.remove_on_complete,
            device_request_timeout: Duration::from_secs(e.device_request_timeout_secs),
            store_retry_limit: e.store_retry_limit,
        })
    }

    /// Registry client, or `None` when no registry URL is configured.
    pub fn registry_client(&self) -> Result<Option<RegistryClient>, ConfigError> {
        let registry = &self.registry;
        let Some(raw) = registry.url.as_deref() else {
            return Ok(None);
        };
        let url: url::Url = raw.parse().map_err(|_| ConfigError::Validation {
            field: "registry.url".into(),
            reason: format!("invalid URL: {raw}"),
        })?;

        let api_key = resolve_api_key(registry)?;
        let tls = if registry.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca) = registry.ca_cert {
            TlsMode::CustomCa(ca.clone())
        } else {
            TlsMode::System
        };
        let transport = TransportConfig {
            tls,
            timeout: Duration::from_secs(registry.timeout_secs),
        };
        Ok(Some(RegistryClient::from_api_key(
            url.as_str(),
            &api_key,
            &transport,
        )?))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("net", "edgesync", "edgesync").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("edgesync");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load config from `path` (or the platform default) plus environment.
///
/// A missing file is not an error; defaults and `EDGESYNC_*` variables
/// still apply. Nested keys use a double underscore:
/// `EDGESYNC_ENGINE__FANOUT_CONCURRENCY=4`.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("EDGESYNC_").split("__"));

    Ok(figment.extract()?)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path` (or the default).
pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(&path, toml_str)?;
    Ok(path)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the registry API key: env var named by `api_key_env`, then
/// the system keyring, then plaintext config.
pub fn resolve_api_key(registry: &RegistrySection) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = registry.api_key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_API_KEY) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(ref key) = registry.api_key {
        return Ok(SecretString::from(key.clone()));
    }

    Err(ConfigError::NoCredentials)
}
