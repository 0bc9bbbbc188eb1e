// ABOUTME: Bounded fan-out over flat sets of independent units of work
// ABOUTME: One shared runner with pluggable isolation (in-process task or OS process) and fail-fast cancellation

pub mod in_process;
pub mod process;

pub use in_process::InProcess;
pub use process::{run_command, CommandSpec, ProcessPool};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{action_fn, Action, ActionResult, ErrorKind, ExecutionContext, TaskError};

/// What a unit executes.
#[derive(Clone)]
pub enum Payload {
    Action(Arc<dyn Action>),
    Command(CommandSpec),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Action(_) => f.write_str("Action(<action>)"),
            Payload::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub name: String,
    pub payload: Payload,
    pub args: Value,
    /// Overrides the runner's default unit timeout.
    pub timeout: Option<Duration>,
}

impl WorkUnit {
    pub fn action(name: impl Into<String>, action: Arc<dyn Action>, args: Value) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Action(action),
            args,
            timeout: None,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self::action(name, action_fn(func), Value::Null)
    }

    pub fn command(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Command(spec),
            args: Value::Null,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Passed,
    Failed,
    /// Interrupted in flight, or never started, by fail-fast.
    Cancelled,
    /// Never started because fail-fast triggered while it was queued.
    Skipped,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Passed => write!(f, "passed"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Cancelled => write!(f, "cancelled"),
            UnitStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    pub name: String,
    pub status: UnitStatus,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub execution_time: Duration,
}

impl UnitResult {
    fn from_result(name: String, result: ActionResult, execution_time: Duration) -> Self {
        match result {
            Ok(value) => Self {
                name,
                status: UnitStatus::Passed,
                success: true,
                value: Some(value),
                error: None,
                error_kind: None,
                execution_time,
            },
            Err(e) => Self {
                name,
                status: UnitStatus::Failed,
                success: false,
                value: None,
                error: Some(e.message),
                error_kind: Some(e.kind),
                execution_time,
            },
        }
    }

    fn cancelled(name: String, status: UnitStatus, message: &str) -> Self {
        Self {
            name,
            status,
            success: false,
            value: None,
            error: Some(message.to_string()),
            error_kind: Some(ErrorKind::Cancelled),
            execution_time: Duration::ZERO,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, UnitStatus::Cancelled | UnitStatus::Skipped)
    }
}

/// Aggregate outcome of one fan-out batch. `results` follows input order.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub batch_id: Uuid,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub execution_time: Duration,
    pub results: Vec<UnitResult>,
}

impl ExecutionResult {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    pub fn is_success(&self) -> bool {
        self.passed == self.total
    }

    pub fn result(&self, name: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Runs a batch of independent units and aggregates their outcomes.
#[async_trait]
pub trait FanOutRunner: Send + Sync {
    async fn run(&self, units: Vec<WorkUnit>) -> ExecutionResult;
}

/// Isolation strategy used by [`FanOut`].
#[async_trait]
pub trait UnitExecutor: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// Whether in-flight units can be interrupted when fail-fast triggers.
    fn interrupts_in_flight(&self) -> bool;

    async fn execute(&self, unit: WorkUnit, context: ExecutionContext) -> ActionResult;
}

pub type UnitCallback = Arc<dyn Fn(&UnitResult) -> anyhow::Result<()> + Send + Sync>;

pub type TaskFanOut = FanOut<InProcess>;
pub type ProcessFanOut = FanOut<ProcessPool>;

pub struct FanOut<E> {
    executor: Arc<E>,
    max_concurrency: Option<usize>,
    fail_fast: bool,
    default_timeout: Option<Duration>,
    callback: Option<UnitCallback>,
}

enum UnitOutcome {
    Finished {
        result: ActionResult,
        elapsed: Duration,
    },
    NotStarted,
}

impl FanOut<InProcess> {
    /// In-process fan-out; `None` leaves concurrency unbounded.
    pub fn new(max_concurrency: Option<usize>, fail_fast: bool) -> Self {
        Self::with_executor(InProcess, max_concurrency, fail_fast)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_concurrency, config.fail_fast)
    }
}

impl FanOut<ProcessPool> {
    /// Process fan-out with `worker_pool_size` concurrent children,
    /// defaulting to the available parallelism.
    pub fn new(worker_pool_size: Option<usize>, fail_fast: bool) -> Self {
        let pool = worker_pool_size.unwrap_or_else(default_pool_size);
        Self::with_executor(ProcessPool, Some(pool), fail_fast)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.worker_pool_size, config.fail_fast)
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl<E: UnitExecutor> FanOut<E> {
    pub fn with_executor(executor: E, max_concurrency: Option<usize>, fail_fast: bool) -> Self {
        Self {
            executor: Arc::new(executor),
            max_concurrency: max_concurrency.map(|n| n.max(1)),
            fail_fast,
            default_timeout: None,
            callback: None,
        }
    }

    /// Default per-unit timeout; a unit's own timeout takes precedence.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Invoked once per unit outcome. Errors and panics are logged only.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UnitResult) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    fn notify(&self, result: &UnitResult) {
        let Some(callback) = &self.callback else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| callback(result))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Completion callback failed for unit {}: {}", result.name, e),
            Err(_) => warn!("Completion callback panicked for unit {}", result.name),
        }
    }

    fn collect(&self, name: String, joined: Result<UnitOutcome, tokio::task::JoinError>) -> UnitResult {
        match joined {
            Ok(UnitOutcome::Finished { result, elapsed }) => {
                UnitResult::from_result(name, result, elapsed)
            }
            Ok(UnitOutcome::NotStarted) => {
                let status = if self.executor.interrupts_in_flight() {
                    UnitStatus::Cancelled
                } else {
                    UnitStatus::Skipped
                };
                UnitResult::cancelled(name, status, "not started: batch failed fast")
            }
            Err(e) if e.is_cancelled() => {
                UnitResult::cancelled(name, UnitStatus::Cancelled, "cancelled: batch failed fast")
            }
            Err(e) => UnitResult::from_result(name, Err(TaskError::from_join(e)), Duration::ZERO),
        }
    }
}

async fn run_unit<E: UnitExecutor>(
    executor: Arc<E>,
    unit: WorkUnit,
    context: ExecutionContext,
    gate: Arc<Semaphore>,
    halt: Arc<AtomicBool>,
    fail_fast: bool,
    limit: Option<Duration>,
) -> UnitOutcome {
    let _permit = gate.acquire_owned().await.ok();
    if halt.load(Ordering::SeqCst) {
        return UnitOutcome::NotStarted;
    }

    let clock = Instant::now();
    let result = match limit {
        Some(limit) => match timeout(limit, executor.execute(unit, context)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::timeout(limit)),
        },
        None => executor.execute(unit, context).await,
    };

    // Raised while still holding the permit so queued units observe it
    if fail_fast && result.is_err() {
        halt.store(true, Ordering::SeqCst);
    }

    UnitOutcome::Finished {
        result,
        elapsed: clock.elapsed(),
    }
}

#[async_trait]
impl<E: UnitExecutor> FanOutRunner for FanOut<E> {
    #[instrument(skip(self, units), fields(runner = self.executor.label(), unit_count = units.len()))]
    async fn run(&self, units: Vec<WorkUnit>) -> ExecutionResult {
        let batch_id = Uuid::new_v4();
        let clock = Instant::now();
        let total = units.len();

        info!(
            "Fanning out {} units (batch {}, max concurrency: {:?}, fail fast: {})",
            total, batch_id, self.max_concurrency, self.fail_fast
        );

        let gate = Arc::new(Semaphore::new(
            self.max_concurrency.unwrap_or(Semaphore::MAX_PERMITS),
        ));
        let halt = Arc::new(AtomicBool::new(false));
        let base_context = ExecutionContext::new(batch_id.to_string(), self.executor.label());

        let mut names = Vec::with_capacity(total);
        let mut abort_handles = Vec::with_capacity(total);
        let mut pending = FuturesUnordered::new();

        for (index, unit) in units.into_iter().enumerate() {
            names.push(unit.name.clone());
            let context = base_context.for_subject(unit.name.clone(), unit.args.clone());
            let limit = unit.timeout.or(self.default_timeout);

            let handle = tokio::spawn(run_unit(
                Arc::clone(&self.executor),
                unit,
                context,
                Arc::clone(&gate),
                Arc::clone(&halt),
                self.fail_fast,
                limit,
            ));
            abort_handles.push(handle.abort_handle());
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<UnitResult>> = vec![None; total];
        let mut interrupted = false;

        while let Some((index, joined)) = pending.next().await {
            let result = self.collect(names[index].clone(), joined);

            match result.status {
                UnitStatus::Passed => debug!("Unit {} passed in {:?}", result.name, result.execution_time),
                UnitStatus::Failed => error!(
                    "Unit {} failed: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                UnitStatus::Cancelled | UnitStatus::Skipped => {
                    debug!("Unit {} {}", result.name, result.status)
                }
            }

            if self.fail_fast
                && result.status == UnitStatus::Failed
                && !interrupted
                && self.executor.interrupts_in_flight()
            {
                interrupted = true;
                halt.store(true, Ordering::SeqCst);
                warn!("Unit {} failed; cancelling remaining units", result.name);
                for handle in &abort_handles {
                    handle.abort();
                }
            }

            self.notify(&result);
            slots[index] = Some(result);
        }

        let results: Vec<UnitResult> = slots.into_iter().flatten().collect();
        let count = |status: UnitStatus| results.iter().filter(|r| r.status == status).count();
        let passed = count(UnitStatus::Passed);
        let failed = count(UnitStatus::Failed);
        let cancelled = count(UnitStatus::Cancelled) + count(UnitStatus::Skipped);

        info!(
            "Batch {} finished: {} passed, {} failed, {} cancelled",
            batch_id, passed, failed, cancelled
        );

        ExecutionResult {
            batch_id,
            total,
            passed,
            failed,
            cancelled,
            execution_time: clock.elapsed(),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::sleep;

    fn sleeper(name: &str, millis: u64) -> WorkUnit {
        let value = name.to_string();
        WorkUnit::from_fn(name, move |_ctx| {
            let value = value.clone();
            async move {
                sleep(Duration::from_millis(millis)).await;
                Ok(json!(value))
            }
        })
    }

    fn failing(name: &str) -> WorkUnit {
        WorkUnit::from_fn(name, |_ctx| async { Err(TaskError::other("unit", "boom")) })
    }

    #[tokio::test]
    async fn test_independent_mode_runs_everything() {
        let runner = TaskFanOut::new(None, false);
        let batch = runner
            .run(vec![sleeper("one", 20), failing("two"), sleeper("three", 20)])
            .await;

        assert_eq!(batch.total, 3);
        assert_eq!(batch.passed, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.cancelled, 0);
        assert_eq!(batch.results[0].name, "one");
        assert_eq!(batch.results[1].error_kind, Some(ErrorKind::Other("unit".to_string())));
        assert_eq!(batch.results[2].value, Some(json!("three")));
        assert!(!batch.is_success());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_in_flight_units() {
        let runner = TaskFanOut::new(None, true);
        let started = Instant::now();
        let batch = runner
            .run(vec![sleeper("one", 2_000), failing("two"), sleeper("three", 2_000)])
            .await;

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.cancelled, 2);

        for name in ["one", "three"] {
            let unit = batch.result(name).unwrap();
            assert!(unit.is_cancelled());
            assert_eq!(unit.status, UnitStatus::Cancelled);
            assert_eq!(unit.error_kind, Some(ErrorKind::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_unit_timeout_overrides_default() {
        let runner = TaskFanOut::new(None, false).with_timeout(Duration::from_secs(5));
        let batch = runner
            .run(vec![
                sleeper("slow", 2_000).with_timeout(Duration::from_millis(30)),
                sleeper("fast", 1),
            ])
            .await;

        let slow = batch.result("slow").unwrap();
        assert_eq!(slow.status, UnitStatus::Failed);
        assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));
        assert!(batch.result("fast").unwrap().success);
    }

    #[tokio::test]
    async fn test_callback_sees_every_outcome_and_errors_are_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let runner = TaskFanOut::new(Some(2), false).with_callback(move |result| {
            sink.lock().unwrap().push(result.name.clone());
            anyhow::bail!("callback sink unavailable")
        });

        let batch = runner
            .run(vec![sleeper("a", 1), failing("b"), sleeper("c", 1)])
            .await;

        assert_eq!(batch.results.len(), 3);
        let mut names = seen.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let batch = TaskFanOut::new(Some(4), true).run(Vec::new()).await;
        assert_eq!(batch.total, 0);
        assert!(batch.is_success());
        assert_eq!(batch.success_rate(), 1.0);
    }
}
