// ABOUTME: Error types for workflow validation, execution and individual units of work
// ABOUTME: Separates fatal workflow errors from recoverable, retry-classified task errors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors raised by workflow validation or by the run loop itself.
///
/// Per-task failures are never reported through this type; they are recorded
/// as `Failed` task status and a [`TaskError`] message instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Duplicate task name: {task}")]
    DuplicateTask { task: String },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("Deadlock: no runnable or skippable tasks among {pending:?}")]
    Deadlock { pending: Vec<String> },

    #[error("Workflow '{workflow}' timed out after {timeout:?}")]
    WorkflowTimeout { workflow: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Classification of a unit-of-work failure, used by retry policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Io,
    Transient,
    Process,
    Cancelled,
    Panicked,
    Unsupported,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Process => write!(f, "process"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Panicked => write!(f, "panicked"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
            ErrorKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A recoverable failure raised by an action, job or fan-out unit.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn other(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other(kind.into()), message)
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("timed out after {:?}", timeout),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Convert a tokio join failure into a task failure.
    pub fn from_join(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            Self::cancelled("task was cancelled")
        } else {
            Self::new(ErrorKind::Panicked, format!("task panicked: {}", error))
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, error.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self::other("serde", error.to_string())
    }
}
