// ABOUTME: Task definitions and the action contract every unit of work implements
// ABOUTME: Provides async and blocking closure adapters plus the Task builder used to assemble workflows

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::context::ExecutionContext;
use super::error::TaskError;
use super::result::TaskStatus;
use super::retry::RetryPolicy;

pub type ActionResult = std::result::Result<Value, TaskError>;

/// A unit of work. Failures are signalled through the returned `TaskError`.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, context: ExecutionContext) -> ActionResult;
}

/// Adapter for async closures.
pub struct FnAction<F> {
    func: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send,
{
    async fn call(&self, context: ExecutionContext) -> ActionResult {
        (self.func)(context).await
    }
}

/// Adapter for synchronous closures, run on the blocking thread pool.
pub struct BlockingAction<F> {
    func: Arc<F>,
}

impl<F> BlockingAction<F>
where
    F: Fn(ExecutionContext) -> ActionResult + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> Action for BlockingAction<F>
where
    F: Fn(ExecutionContext) -> ActionResult + Send + Sync + 'static,
{
    async fn call(&self, context: ExecutionContext) -> ActionResult {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(context))
            .await
            .map_err(TaskError::from_join)?
    }
}

/// Wrap an async closure as a shareable action.
pub fn action_fn<F, Fut>(func: F) -> Arc<dyn Action>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(FnAction::new(func))
}

/// Wrap a synchronous closure as a shareable action.
pub fn blocking_fn<F>(func: F) -> Arc<dyn Action>
where
    F: Fn(ExecutionContext) -> ActionResult + Send + Sync + 'static,
{
    Arc::new(BlockingAction::new(func))
}

pub type Condition = Arc<dyn Fn(&HashMap<String, Value>) -> bool + Send + Sync>;
pub type Transform = Arc<dyn Fn(Value) -> ActionResult + Send + Sync>;

/// A named node of a workflow graph.
///
/// Configuration fields are set with the builder methods before the task is
/// added to a workflow. Runtime fields are only ever written by the engine.
pub struct Task {
    pub name: String,
    pub action: Arc<dyn Action>,
    pub args: Value,
    pub dependencies: BTreeSet<String>,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub condition: Option<Condition>,
    pub transform_result: Option<Transform>,
    pub tags: BTreeSet<String>,
    pub metadata: HashMap<String, String>,

    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub execution_time: Option<Duration>,
}

impl Task {
    pub fn new(name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            action,
            args: Value::Null,
            dependencies: BTreeSet::new(),
            timeout: None,
            retry_policy: None,
            condition: None,
            transform_result: None,
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            execution_time: None,
        }
    }

    /// Build a task from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self::new(name, action_fn(func))
    }

    /// Build a task from a synchronous closure.
    pub fn blocking<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionContext) -> ActionResult + Send + Sync + 'static,
    {
        Self::new(name, blocking_fn(func))
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&HashMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> ActionResult + Send + Sync + 'static,
    {
        self.transform_result = Some(Arc::new(transform));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.attempts = 0;
        self.execution_time = None;
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("has_condition", &self.condition.is_some())
            .field("has_transform", &self.transform_result.is_some())
            .field("tags", &self.tags)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .finish()
    }
}
