// ABOUTME: Workflow container owning a named set of tasks and their recorded results
// ABOUTME: Handles task registration, graph validation, planning and post-run status queries

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::dependency::{DependencyGraph, ExecutionPlan};
use super::error::{ExecutionError, Result};
use super::executor::WorkflowEngine;
use super::result::{TaskResult, TaskStatus, WorkflowSummary};
use super::retry::RetryPolicy;
use super::task::Task;
use crate::config::Config;

#[derive(Debug)]
pub struct Workflow {
    pub name: String,
    pub timeout: Option<Duration>,
    pub fail_fast: bool,
    /// Applied to tasks that carry no retry policy of their own.
    pub default_retry: Option<RetryPolicy>,
    pub tasks: IndexMap<String, Task>,
    pub task_results: HashMap<String, TaskResult>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            fail_fast: false,
            default_retry: None,
            tasks: IndexMap::new(),
            task_results: HashMap::new(),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        Self {
            timeout: config.workflow_timeout,
            fail_fast: config.fail_fast,
            default_retry: config.default_retry.clone(),
            ..Self::new(name)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    /// Register a task. Names must be unique within the workflow.
    pub fn add_task(&mut self, task: Task) -> Result<&mut Self> {
        if self.tasks.contains_key(&task.name) {
            return Err(ExecutionError::DuplicateTask { task: task.name });
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(self)
    }

    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::build(
            self.tasks
                .iter()
                .map(|(name, task)| (name.as_str(), task.dependencies.iter())),
        )
    }

    /// Check that every dependency exists and that the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        self.dependency_graph()?.detect_cycles()
    }

    /// Static wave decomposition, ignoring conditions and failures.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        self.dependency_graph()?.create_execution_plan()
    }

    /// Run with a default engine.
    pub async fn run(&mut self) -> Result<HashMap<String, Value>> {
        WorkflowEngine::new().run(self).await
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(name).map(|task| task.status)
    }

    pub fn result_of(&self, name: &str) -> Option<&TaskResult> {
        self.task_results.get(name)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .map(|task| task.name.as_str())
            .collect()
    }

    pub fn tasks_tagged(&self, tag: &str) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|task| task.tags.contains(tag))
            .map(|task| task.name.as_str())
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary::from_results(self.task_results.values())
    }

    pub(crate) fn reset(&mut self) {
        for task in self.tasks.values_mut() {
            task.reset();
        }
        self.task_results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::ExecutionContext;

    fn noop(name: &str) -> Task {
        Task::from_fn(name, |_ctx: ExecutionContext| async { Ok(Value::Null) })
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut workflow = Workflow::new("dup");
        workflow.add_task(noop("build")).unwrap();

        let err = workflow.add_task(noop("build")).unwrap_err();
        assert_eq!(
            err,
            ExecutionError::DuplicateTask {
                task: "build".to_string()
            }
        );
        assert_eq!(workflow.tasks.len(), 1);
    }

    #[test]
    fn test_add_task_chains() {
        let mut workflow = Workflow::new("chain");
        workflow
            .add_task(noop("a"))
            .unwrap()
            .add_task(noop("b").depends_on("a"))
            .unwrap();

        assert!(workflow.validate().is_ok());
        let plan = workflow.plan().unwrap();
        assert_eq!(plan.waves, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_validate_reports_unknown_dependency() {
        let mut workflow = Workflow::new("broken");
        workflow.add_task(noop("deploy").depends_on("build")).unwrap();

        assert!(matches!(
            workflow.validate(),
            Err(ExecutionError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_tag_queries() {
        let mut workflow = Workflow::new("tags");
        workflow.add_task(noop("a").with_tag("ci")).unwrap();
        workflow.add_task(noop("b")).unwrap();

        assert_eq!(workflow.tasks_tagged("ci"), vec!["a"]);
        assert_eq!(workflow.tasks_with_status(TaskStatus::Pending), vec!["a", "b"]);
    }
}
