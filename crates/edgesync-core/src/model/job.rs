// ── Jobs and tasks ──
//
// A job is addressed to exactly one device and carries ordered tasks
// plus the response metadata the owning feature reads back in its
// callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString};

use super::entity_id::{DeviceId, JobId, OrgId};

pub const AGGREGATED_MESSAGE: &str = "aggregated";
pub const AGENT_ENTITY: &str = "agent";

// ── Task ────────────────────────────────────────────────────────────

/// One device command: `{entity, message, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub entity: String,
    pub message: String,
    #[serde(default)]
    pub params: Value,
}

impl Task {
    pub fn agent(message: impl Into<String>, params: Value) -> Self {
        Self {
            entity: AGENT_ENTITY.into(),
            message: message.into(),
            params,
        }
    }

    /// Wrap tasks so the device applies them as one transition.
    pub fn aggregated(requests: Vec<Task>) -> Self {
        Self::agent(AGGREGATED_MESSAGE, json!({ "requests": requests }))
    }

    pub fn is_aggregated(&self) -> bool {
        self.entity == AGENT_ENTITY && self.message == AGGREGATED_MESSAGE
    }

    /// Expand aggregated wrappers into their sub-requests.
    pub fn flatten(tasks: &[Task]) -> Vec<Task> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.is_aggregated() {
                let inner: Vec<Task> = task
                    .params
                    .get("requests")
                    .cloned()
                    .and_then(|r| serde_json::from_value(r).ok())
                    .unwrap_or_default();
                out.extend(Self::flatten(&inner));
            } else {
                out.push(task.clone());
            }
        }
        out
    }
}

impl From<Task> for edgesync_api::AgentMessage {
    fn from(task: Task) -> Self {
        Self {
            entity: task.entity,
            message: task.message,
            params: task.params,
        }
    }
}

// ── Options ─────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub priority: JobPriority,
    pub attempts: u32,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            attempts: 1,
            remove_on_complete: true,
        }
    }
}

/// `{method, data}` carried by the job and handed back to callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

// ── Job ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Inactive,
    Delayed,
    Active,
    Complete,
    Failed,
    Removed,
}

impl JobState {
    /// The device has not confirmed the job yet.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Inactive | Self::Delayed | Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub device: DeviceId,
    pub org: OrgId,
    pub user: String,
    pub title: String,
    pub tasks: Vec<Task>,
    pub meta: ResponseMeta,
    pub options: JobOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_override: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Tasks with aggregated wrappers expanded.
    pub fn flat_tasks(&self) -> Vec<Task> {
        Task::flatten(&self.tasks)
    }

    /// Method that receives the completion callback.
    pub fn completion_method(&self) -> &str {
        self.complete_override
            .as_deref()
            .unwrap_or(&self.meta.method)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregated_wrapper_shape() {
        let task = Task::aggregated(vec![
            Task::agent("remove-dhcp-config", json!({"interface": "L"})),
            Task::agent("add-dhcp-config", json!({"interface": "L"})),
        ]);
        let wire = serde_json::to_value(&task).unwrap();
        assert_eq!(wire["entity"], "agent");
        assert_eq!(wire["message"], "aggregated");
        assert_eq!(wire["params"]["requests"][1]["message"], "add-dhcp-config");
    }

    #[test]
    fn flatten_expands_nested_aggregates() {
        let inner = Task::aggregated(vec![Task::agent("b", Value::Null)]);
        let outer = vec![Task::aggregated(vec![Task::agent("a", Value::Null), inner])];
        let names: Vec<_> = Task::flatten(&outer)
            .into_iter()
            .map(|t| t.message)
            .collect();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<JobPriority>().unwrap(), JobPriority::High);
        assert_eq!(JobPriority::default().to_string(), "normal");
    }
}
