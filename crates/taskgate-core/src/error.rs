//! Error types for TaskGate.

use thiserror::Error;

/// Errors returned by TaskGate components.
///
/// Expected conditions (no eligible task, a suppressed operation) are not
/// errors and never show up here.
#[derive(Debug, Error)]
pub enum TaskGateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Session '{session}' is already held by task {holder}")]
    SessionBusy { session: String, holder: String },

    #[error("Invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, TaskGateError>;
