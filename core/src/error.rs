use std::io;
use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestration engine.
///
/// Agent-side faults are deliberately absent: a misbehaving agent is
/// reified as a `FAILED` or `UNKNOWN` status and handled by the rule
/// table, never raised as an error.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid rule '{id}': {message}")]
    InvalidRule { id: String, message: String },

    #[error("no initial rule matched the workflow start")]
    NoInitialRule,

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("maximum worktrees ({max}) reached")]
    WorktreeCapacity { max: usize },

    #[error("dependency cycle detected, remaining tasks: {remaining:?}")]
    DependencyCycle { remaining: Vec<String> },

    #[error("task file not found: {0}")]
    TaskFileNotFound(String),

    #[error("interrupted by user")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl OrchestratorError {
    /// Helper for git command failures.
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
