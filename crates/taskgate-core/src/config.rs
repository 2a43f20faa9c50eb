//! TaskGate configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskGateError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGateConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
}

impl TaskGateConfig {
    /// Load config from the default path (~/.taskgate/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskGateError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskGateError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskGateError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskGate home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskgate")
    }
}

/// Scheduler and task store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// How long a completed task stays visible before garbage collection.
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,
    /// How long a terminally failed task stays visible.
    #[serde(default = "default_failed_ttl_secs")]
    pub failed_ttl_secs: u64,
    /// An in-progress task not updated for this long is presumed abandoned.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Buffer size of the scheduler event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_store_path() -> String { "~/.taskgate/tasks.json".into() }
fn default_completed_ttl_secs() -> u64 { 24 * 60 * 60 }
fn default_failed_ttl_secs() -> u64 { 72 * 60 * 60 }
fn default_stale_timeout_secs() -> u64 { 30 * 60 }
fn default_maintenance_interval_ms() -> u64 { 60_000 }
fn default_flush_interval_ms() -> u64 { 5_000 }
fn default_event_capacity() -> usize { 256 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            completed_ttl_secs: default_completed_ttl_secs(),
            failed_ttl_secs: default_failed_ttl_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Store path with `~` expanded.
    pub fn resolved_store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store_path).to_string())
    }
}

/// Guardrail pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_max_steps_per_action")]
    pub max_steps_per_action: u32,
    /// Step floor applied to user-lane runs so interactive work is not cut short.
    #[serde(default = "default_min_user_steps")]
    pub min_user_steps: u32,
    #[serde(default = "default_max_messages_per_action")]
    pub max_messages_per_action: u32,
    /// How many recent messages per destination are kept for comparison.
    #[serde(default = "default_message_dedup_window")]
    pub message_dedup_window: usize,
    #[serde(default = "default_message_similarity_threshold")]
    pub message_similarity_threshold: f64,
    #[serde(default = "default_max_tool_loops")]
    pub max_tool_loops: u32,
    /// Upper bound on destinations tracked by the message history.
    #[serde(default = "default_max_destinations")]
    pub max_destinations: usize,
    #[serde(default = "default_filler_phrases")]
    pub filler_phrases: Vec<String>,
    #[serde(default = "default_reassurance_phrases")]
    pub reassurance_phrases: Vec<String>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRuleConfig>,
}

fn default_max_steps_per_action() -> u32 { 10 }
fn default_min_user_steps() -> u32 { 6 }
fn default_max_messages_per_action() -> u32 { 5 }
fn default_message_dedup_window() -> usize { 5 }
fn default_message_similarity_threshold() -> f64 { 0.85 }
fn default_max_tool_loops() -> u32 { 3 }
fn default_max_destinations() -> usize { 256 }

fn default_filler_phrases() -> Vec<String> {
    [
        "just to let you know",
        "here is what i found",
        "here's what i found",
        "let me know if you need anything else",
        "let me know if you have any questions",
        "i hope this helps",
        "as requested",
        "sure",
        "okay",
        "ok",
        "great",
        "alright",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_reassurance_phrases() -> Vec<String> {
    [
        "on it",
        "still working",
        "working on it",
        "one moment",
        "give me a moment",
        "looking into it",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_steps_per_action: default_max_steps_per_action(),
            min_user_steps: default_min_user_steps(),
            max_messages_per_action: default_max_messages_per_action(),
            message_dedup_window: default_message_dedup_window(),
            message_similarity_threshold: default_message_similarity_threshold(),
            max_tool_loops: default_max_tool_loops(),
            max_destinations: default_max_destinations(),
            filler_phrases: default_filler_phrases(),
            reassurance_phrases: default_reassurance_phrases(),
            routing_rules: Vec::new(),
        }
    }
}

/// A routing rule as written in config. Compiled once by the guardrail router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    /// Regex matched (case-insensitively) against the task description.
    pub pattern: String,
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub avoided: Vec<String>,
    /// Restrict the surviving batch to `preferred` tools when the rule matches.
    #[serde(default)]
    pub require_preferred: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskGateConfig::default();
        assert_eq!(config.scheduler.completed_ttl_secs, 86_400);
        assert_eq!(config.scheduler.failed_ttl_secs, 259_200);
        assert_eq!(config.scheduler.stale_timeout_secs, 1_800);
        assert_eq!(config.scheduler.maintenance_interval_ms, 60_000);
        assert_eq!(config.scheduler.flush_interval_ms, 5_000);
        assert_eq!(config.guardrails.max_steps_per_action, 10);
        assert!(config.guardrails.routing_rules.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TaskGateConfig = toml::from_str(
            r#"
            [scheduler]
            stale_timeout_secs = 60

            [[guardrails.routing_rules]]
            pattern = "weather"
            preferred = ["web_search"]
            require_preferred = true
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.stale_timeout_secs, 60);
        assert_eq!(config.scheduler.completed_ttl_secs, 86_400);
        assert_eq!(config.guardrails.routing_rules.len(), 1);
        assert!(config.guardrails.routing_rules[0].avoided.is_empty());
        assert!(config.guardrails.routing_rules[0].require_preferred);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = TaskGateConfig::default();
        config.guardrails.max_tool_loops = 7;
        config.save_to(&path).unwrap();

        let loaded = TaskGateConfig::load_from(&path).unwrap();
        assert_eq!(loaded.guardrails.max_tool_loops, 7);
    }

    #[test]
    fn test_load_from_garbage_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "scheduler = [not toml").unwrap();
        let err = TaskGateConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, TaskGateError::Config(_)));
    }

    #[test]
    fn test_store_path_tilde_expanded() {
        let config = SchedulerConfig::default();
        let path = config.resolved_store_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("tasks.json"));
    }
}
