//! Per-evaluation run context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::operation::{Intent, ToolKind, intent_of};

/// An operation that already executed earlier in the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Step at which it ran.
    pub step: u32,
    /// Reference to a produced artifact, for generation tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl ToolInvocation {
    pub fn new(name: &str, args: Value, step: u32) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_string(),
            args,
            step,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: &str) -> Self {
        self.artifact = Some(artifact.to_string());
        self
    }
}

/// Everything the pipeline knows about the run a batch belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    /// Task being worked on. Also scopes per-run dedup state.
    pub task_id: String,
    /// Interactive-lane runs get the minimum step floor.
    #[serde(default)]
    pub interactive: bool,
    /// Current step, 1-based.
    pub step: u32,
    #[serde(default)]
    pub task_description: String,
    /// Where the run was triggered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Default recipient for messages that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Messages already delivered in this run.
    #[serde(default)]
    pub messages_sent: u32,
    /// Overrides the configured step budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_budget: Option<u32>,
    /// Overrides the configured message budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_budget: Option<u32>,
    /// Tools the run may call, with their kind.
    #[serde(default)]
    pub allowed_tools: BTreeMap<String, ToolKind>,
    /// Operations executed so far, oldest first.
    #[serde(default)]
    pub history: Vec<ToolInvocation>,
}

impl RunContext {
    pub fn new(task_id: &str, step: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            step,
            ..Self::default()
        }
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.task_description = description.to_string();
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn messages_sent(mut self, count: u32) -> Self {
        self.messages_sent = count;
        self
    }

    pub fn allow(mut self, tool: &str, kind: ToolKind) -> Self {
        self.allowed_tools.insert(tool.to_string(), kind);
        self
    }

    pub fn record(mut self, invocation: ToolInvocation) -> Self {
        self.history.push(invocation);
        self
    }

    /// Kind of `tool`, or `None` when the run may not call it.
    pub fn kind_of(&self, tool: &str) -> Option<ToolKind> {
        self.allowed_tools.get(tool).copied()
    }

    /// History invocations with their kind and typed intent.
    pub(crate) fn past(&self) -> impl Iterator<Item = (&ToolInvocation, ToolKind, Intent)> {
        self.history.iter().map(|inv| {
            let kind = self.kind_of(&inv.name).unwrap_or(ToolKind::Other);
            (inv, kind, intent_of(&inv.args, kind))
        })
    }

    /// Invocations after the most recent message in history.
    pub(crate) fn since_last_message(&self) -> &[ToolInvocation] {
        let start = self
            .history
            .iter()
            .rposition(|inv| self.kind_of(&inv.name) == Some(ToolKind::Message))
            .map_or(0, |i| i + 1);
        &self.history[start..]
    }

    /// Whether a non-message tool produced output after `since_step`.
    /// With no reference step, any non-message output counts.
    pub(crate) fn has_new_output(&self, since_step: Option<u32>) -> bool {
        self.history.iter().any(|inv| {
            self.kind_of(&inv.name) != Some(ToolKind::Message)
                && since_step.is_none_or(|step| inv.step > step)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new("task-1", 4)
            .allow("send_message", ToolKind::Message)
            .allow("web_search", ToolKind::Search)
            .record(ToolInvocation::new("web_search", json!({"q": "a"}), 1))
            .record(ToolInvocation::new("send_message", json!({"text": "hi"}), 2))
            .record(ToolInvocation::new("web_search", json!({"q": "b"}), 3))
    }

    #[test]
    fn test_since_last_message() {
        let ctx = ctx();
        let tail = ctx.since_last_message();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].step, 3);
    }

    #[test]
    fn test_new_output() {
        let ctx = ctx();
        assert!(ctx.has_new_output(Some(2)));
        assert!(!ctx.has_new_output(Some(3)));
        assert!(ctx.has_new_output(None));
        assert!(!RunContext::new("t", 1).has_new_output(None));
    }

    #[test]
    fn test_deserialize_minimal() {
        let ctx: RunContext =
            serde_json::from_value(json!({"taskId": "t", "step": 2, "allowedTools": {"ping": "other"}}))
                .unwrap();
        assert_eq!(ctx.kind_of("ping"), Some(ToolKind::Other));
        assert_eq!(ctx.messages_sent, 0);
        assert!(!ctx.interactive);
    }
}
