//! Task definitions — the persisted unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::retry::RetryPolicy;

/// Scheduling lane. Each lane is its own fairness domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Interactive, user-facing work. Always preferred.
    User,
    /// Background work the agent gives itself.
    Autonomy,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::User, Lane::Autonomy];
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::User => write!(f, "user"),
            Lane::Autonomy => write!(f, "autonomy"),
        }
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Lane::User),
            "autonomy" => Ok(Lane::Autonomy),
            other => Err(format!("unknown lane '{other}'")),
        }
    }
}

/// Task status.
///
/// ```text
/// pending ──▶ in-progress ──▶ completed
///    ▲  │          │  ▲
///    │  │          ▼  │
///    │  └──────▶ waiting
///    │             │
///    └── retry ◀── failed (terminal once retries are spent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Waiting,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Waiting,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Holds its session scope while in this status.
    pub fn holds_session(self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Waiting)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

/// What the decision process consumes.
///
/// The scheduler only reads `session_scope_id`, and only as an opaque
/// grouping key. Everything channel-specific lives in `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            ..Self::default()
        }
    }

    /// Shallow merge. Typed keys update their fields, `null` clears,
    /// anything else is stored in `metadata`.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "description" => {
                    if let Value::String(s) = value {
                        self.description = s;
                    }
                }
                "sessionScopeId" => self.session_scope_id = value_to_opt_string(value),
                "channel" => self.channel = value_to_opt_string(value),
                _ if value.is_null() => {
                    self.metadata.remove(&key);
                }
                _ => {
                    self.metadata.insert(key, value);
                }
            }
        }
    }

    /// Session scope this payload would have after `merge(patch)`.
    pub fn scope_after(&self, patch: &Map<String, Value>) -> Option<String> {
        match patch.get("sessionScopeId") {
            Some(value) => value_to_opt_string(value.clone()),
            None => self.session_scope_id.clone(),
        }
    }
}

fn value_to_opt_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique, immutable.
    pub id: String,
    pub payload: TaskPayload,
    /// Higher runs first.
    pub priority: i64,
    pub lane: Lane,
    pub status: TaskStatus,
    /// Ineligible until this task is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Terminal tasks are garbage collected after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task with no retries, priority 0.
    pub fn new(description: &str, lane: Lane) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: TaskPayload::new(description),
            priority: 0,
            lane,
            status: TaskStatus::Pending,
            depends_on: None,
            retry: RetryPolicy::none(),
            expires_at: None,
            timestamp: now,
            updated_at: now,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn session(mut self, session_scope_id: &str) -> Self {
        self.payload.session_scope_id = Some(session_scope_id.to_string());
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.payload.channel = Some(channel.to_string());
        self
    }

    pub fn depends_on(mut self, parent_id: &str) -> Self {
        self.depends_on = Some(parent_id.to_string());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.payload.metadata.insert(key.to_string(), value);
        self
    }

    pub fn session_scope(&self) -> Option<&str> {
        self.payload.session_scope_id.as_deref()
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let task = Task::new("summarise inbox", Lane::Autonomy);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 0);
        assert_eq!(task.retry, RetryPolicy::none());
        assert!(task.depends_on.is_none());
        assert!(task.expires_at.is_none());
        assert_ne!(task.id, Task::new("x", Lane::User).id);
    }

    #[test]
    fn test_wire_format() {
        let task = Task::new("reply", Lane::User)
            .session("telegram:42")
            .depends_on("parent")
            .meta("chatId", json!(42));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["lane"], "user");
        assert_eq!(value["dependsOn"], "parent");
        assert_eq!(value["payload"]["sessionScopeId"], "telegram:42");
        assert_eq!(value["payload"]["chatId"], 42);
        assert_eq!(value["retry"]["maxAttempts"], 0);

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            "in-progress"
        );
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("running".parse::<TaskStatus>().is_err());
        assert_eq!("autonomy".parse::<Lane>(), Ok(Lane::Autonomy));
    }

    #[test]
    fn test_payload_merge() {
        let mut payload = TaskPayload::new("old");
        payload.metadata.insert("keep".into(), json!(1));
        payload.metadata.insert("drop".into(), json!(2));

        let patch = json!({
            "description": "new",
            "sessionScopeId": "s1",
            "progress": 0.5,
            "drop": null,
        });
        let Value::Object(patch) = patch else { unreachable!() };
        payload.merge(patch);

        assert_eq!(payload.description, "new");
        assert_eq!(payload.session_scope_id.as_deref(), Some("s1"));
        assert_eq!(payload.metadata["keep"], 1);
        assert_eq!(payload.metadata["progress"], 0.5);
        assert!(!payload.metadata.contains_key("drop"));
    }
}
