// ABOUTME: Main library module for the wavefront task orchestration engine
// ABOUTME: Exports the workflow engine, priority scheduler and fan-out runners

pub mod config;
pub mod engine;
pub mod fanout;
pub mod logging;
pub mod scheduler;

// Re-export commonly used types
pub use config::{Config, LoggingConfig};
pub use engine::{
    action_fn, blocking_fn, ExecutionContext, ExecutionError, RetryPolicy, Task, TaskError,
    TaskStatus, Workflow, WorkflowEngine, WorkflowStatus,
};
pub use fanout::{
    CommandSpec, ExecutionResult, FanOutRunner, ProcessFanOut, TaskFanOut, UnitResult, WorkUnit,
};
pub use logging::init_logging;
pub use scheduler::{JobId, JobStatus, PriorityScheduler};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
