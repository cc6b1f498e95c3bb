//! Shared helpers for command handlers.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;

use edgesync_core::{Device, DeviceId, Store};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::fleet::Fleet;

/// Config file in effect: `--config` or the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(edgesync_config::config_path)
}

/// Look a device up in the fleet store.
pub async fn require_device(fleet: &Fleet, id: &str) -> Result<Device, CliError> {
    fleet
        .store
        .device(&DeviceId::from(id))
        .await
        .map_err(edgesync_core::CoreError::from)?
        .ok_or_else(|| CliError::NotFound {
            resource_type: "device".into(),
            identifier: id.into(),
            list_command: "devices list".into(),
        })
}

/// Read and parse a JSON file for `--from-file` flags.
pub fn read_json_file(path: &Path) -> Result<Value, CliError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| CliError::Validation {
        field: "from-file".into(),
        reason: format!("invalid JSON: {e}"),
    })
}

/// Parse an inline JSON flag value.
pub fn parse_json_arg(field: &str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|e| CliError::Validation {
        field: field.into(),
        reason: format!("invalid JSON: {e}"),
    })
}

/// Read a file holding one document or an array of them.
pub fn read_documents<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CliError> {
    match read_json_file(path)? {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(CliError::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

/// `-` for empty optional fields in detail views.
pub fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Doc {
        id: String,
    }

    #[test]
    fn documents_accept_object_or_array() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.json");
        let many = dir.path().join("many.json");
        std::fs::write(&one, r#"{"id": "a"}"#).unwrap();
        std::fs::write(&many, r#"[{"id": "a"}, {"id": "b"}]"#).unwrap();

        let one: Vec<Doc> = read_documents(&one).unwrap();
        let many: Vec<Doc> = read_documents(&many).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(many[1].id, "b");
    }

    #[test]
    fn bad_inline_json_is_a_usage_error() {
        let err = parse_json_arg("data", "{not json").unwrap_err();
        assert!(matches!(err, CliError::Validation { ref field, .. } if field == "data"));
    }
}
