// ABOUTME: Workflow execution engine module
// ABOUTME: Handles task graphs, dependency resolution, wave dispatch, retries and lifecycle events

pub mod context;
pub mod dependency;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod observer;
pub mod result;
pub mod retry;
pub mod task;
pub mod workflow;

pub use context::{ExecutionContext, ResultsSnapshot};
pub use dependency::{DependencyGraph, ExecutionPlan};
pub use dispatch::{StatusBoard, WaveDispatcher};
pub use error::{ErrorKind, ExecutionError, Result, TaskError};
pub use executor::WorkflowEngine;
pub use observer::{emit, ChannelObserver, Event, FnObserver, Observer, TracingObserver};
pub use result::{SkipReason, TaskResult, TaskStatus, WorkflowStatus, WorkflowSummary};
pub use retry::RetryPolicy;
pub use task::{action_fn, blocking_fn, Action, ActionResult, BlockingAction, FnAction, Task};
pub use workflow::Workflow;
