// ABOUTME: Task status, terminal task result snapshots and workflow run summaries
// ABOUTME: Defines outcome structures recorded by the engine once a task reaches a terminal state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Why a task was skipped instead of executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Condition,
    DependencyFailed(String),
    DependencySkipped(String),
    Cancelled,
    WorkflowTimeout,
}

/// Immutable snapshot of a task that reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub status: TaskStatus,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub execution_time: Duration,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(
        task: String,
        value: Value,
        attempts: u32,
        started_at: DateTime<Utc>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task,
            status: TaskStatus::Completed,
            success: true,
            value: Some(value),
            error: None,
            skip_reason: None,
            execution_time,
            attempts,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        task: String,
        error: String,
        attempts: u32,
        started_at: DateTime<Utc>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task,
            status: TaskStatus::Failed,
            success: false,
            value: None,
            error: Some(error),
            skip_reason: None,
            execution_time,
            attempts,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(task: String, reason: SkipReason) -> Self {
        Self {
            task,
            status: TaskStatus::Skipped,
            success: false,
            value: None,
            error: Some(reason.to_string()),
            skip_reason: Some(reason),
            execution_time: Duration::ZERO,
            attempts: 0,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Success,
    Failed,
    PartialSuccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub success_rate: f64,
}

impl WorkflowSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TaskResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.total_tasks += 1;
            match result.status {
                TaskStatus::Completed => summary.completed_tasks += 1,
                TaskStatus::Failed => summary.failed_tasks += 1,
                TaskStatus::Skipped => summary.skipped_tasks += 1,
                _ => {}
            }
        }

        summary.success_rate = if summary.total_tasks > 0 {
            (summary.completed_tasks as f64 / summary.total_tasks as f64) * 100.0
        } else {
            0.0
        };
        summary
    }

    pub fn status(&self) -> WorkflowStatus {
        match (self.failed_tasks > 0, self.completed_tasks > 0) {
            (false, _) => WorkflowStatus::Success, // includes all-skipped
            (true, false) => WorkflowStatus::Failed,
            (true, true) => WorkflowStatus::PartialSuccess,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Retrying => write!(f, "retrying"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Condition => write!(f, "Condition not met"),
            SkipReason::DependencyFailed(dep) => write!(f, "Dependency '{}' failed", dep),
            SkipReason::DependencySkipped(dep) => write!(f, "Dependency '{}' was skipped", dep),
            SkipReason::Cancelled => write!(f, "Cancelled after an earlier failure"),
            SkipReason::WorkflowTimeout => write!(f, "Workflow timed out"),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Success => write!(f, "success"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::PartialSuccess => write!(f, "partial_success"),
        }
    }
}
