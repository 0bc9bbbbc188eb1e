// ABOUTME: Main workflow engine orchestrating wave-based execution of a task graph
// ABOUTME: Coordinates validation, condition checks, skip propagation, fail-fast and timeouts

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::context::ExecutionContext;
use super::dispatch::{Invocation, InvocationOutcome, StatusBoard, WaveDispatcher};
use super::error::{ExecutionError, Result};
use super::observer::{emit, Event, Observer, TracingObserver};
use super::result::{SkipReason, TaskResult, TaskStatus};
use super::retry::RetryPolicy;
use super::workflow::Workflow;
use crate::config::Config;

pub struct WorkflowEngine {
    dispatcher: WaveDispatcher,
    observer: Arc<dyn Observer>,
    board: StatusBoard,
}

/// Terminal bookkeeping for a single run.
#[derive(Default)]
struct RunState {
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    results: HashMap<String, Value>,
}

impl RunState {
    fn resolved(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            dispatcher: WaveDispatcher::new(None),
            observer: Arc::new(TracingObserver),
            board: StatusBoard::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            dispatcher: WaveDispatcher::new(config.max_concurrency),
            ..Self::new()
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Cap the number of tasks running at once inside a wave.
    pub fn with_max_concurrency(mut self, max_concurrent: usize) -> Self {
        self.dispatcher = WaveDispatcher::new(Some(max_concurrent));
        self
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.dispatcher.max_concurrent()
    }

    /// Live status of a task in the current (or most recent) run, including
    /// `Retrying` while the task waits out a backoff delay.
    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.board.get(name)
    }

    /// Execute a workflow and return the values of every completed task.
    ///
    /// Failed and skipped tasks are absent from the returned map; inspect
    /// `Workflow::task_results` or task statuses to detect partial failure.
    #[instrument(skip(self, workflow), fields(workflow_name = %workflow.name))]
    pub async fn run(&self, workflow: &mut Workflow) -> Result<HashMap<String, Value>> {
        workflow.validate()?;
        workflow.reset();
        self.board.clear();
        for name in workflow.tasks.keys() {
            self.board.set(name, TaskStatus::Pending);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let clock = Instant::now();
        let total = workflow.tasks.len();
        let base_context = ExecutionContext::new(run_id.clone(), workflow.name.clone());

        info!(
            "Starting workflow execution: {} (run_id: {}, {} tasks)",
            workflow.name, run_id, total
        );
        self.emit(
            Event::new(workflow.name.clone(), "started")
                .with("run_id", run_id.clone())
                .with("tasks", total),
        );

        let mut state = RunState::default();
        let mut cancelled = false;
        let mut wave_number = 0usize;

        while state.resolved() < total {
            if cancelled {
                warn!("Fail-fast triggered, not scheduling further waves");
                self.skip_pending(workflow, &mut state, SkipReason::Cancelled);
                self.emit(Event::new(workflow.name.clone(), "cancelled"));
                break;
            }

            if let Some(limit) = workflow.timeout {
                if clock.elapsed() >= limit {
                    error!("Workflow {} exceeded its timeout of {:?}", workflow.name, limit);
                    self.skip_pending(workflow, &mut state, SkipReason::WorkflowTimeout);
                    self.emit(
                        Event::new(workflow.name.clone(), "timeout")
                            .with("timeout_ms", limit.as_millis() as u64),
                    );
                    return Err(ExecutionError::WorkflowTimeout {
                        workflow: workflow.name.clone(),
                        timeout: limit,
                    });
                }
            }

            let skipped_before = state.skipped.len();
            let runnable = self.collect_runnable(workflow, &mut state);

            if runnable.is_empty() {
                if state.resolved() == total {
                    break;
                }

                let newly_skipped = self.propagate_skips(workflow, &mut state);
                if newly_skipped == 0 && state.skipped.len() == skipped_before {
                    let pending = workflow.tasks_with_status(TaskStatus::Pending);
                    let pending: Vec<String> = pending.into_iter().map(String::from).collect();
                    error!("Deadlock detected, unresolved tasks: {:?}", pending);
                    self.emit(
                        Event::new(workflow.name.clone(), "deadlock")
                            .with("pending", pending.clone()),
                    );
                    return Err(ExecutionError::Deadlock { pending });
                }
                continue;
            }

            wave_number += 1;
            info!(
                "Executing wave {} with {} tasks: {:?}",
                wave_number,
                runnable.len(),
                runnable
            );
            self.emit(
                Event::new(workflow.name.clone(), "wave_started")
                    .with("wave", wave_number)
                    .with("tasks", runnable.clone()),
            );

            let invocations = self.prepare_wave(workflow, &runnable);
            let context = base_context
                .clone()
                .with_results(Arc::new(state.results.clone()));
            let outcomes = self
                .dispatcher
                .execute_wave(invocations, &context, &self.observer)
                .await;

            for outcome in outcomes {
                let failed = self.record_outcome(workflow, &mut state, outcome);
                if failed && workflow.fail_fast {
                    cancelled = true;
                }
            }
        }

        let summary = workflow.summary();
        info!(
            "Workflow execution completed in {:?}: {} completed, {} failed, {} skipped",
            clock.elapsed(),
            summary.completed_tasks,
            summary.failed_tasks,
            summary.skipped_tasks
        );
        self.emit(
            Event::new(workflow.name.clone(), "finished")
                .with("status", summary.status().to_string())
                .with("completed", summary.completed_tasks)
                .with("failed", summary.failed_tasks)
                .with("skipped", summary.skipped_tasks),
        );

        Ok(state.results)
    }

    /// Pending tasks whose dependencies all completed. Tasks whose condition
    /// rejects the current results are skipped here and not returned.
    fn collect_runnable(&self, workflow: &mut Workflow, state: &mut RunState) -> Vec<String> {
        let candidates: Vec<String> = workflow
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| state.completed.contains(dep))
            })
            .map(|task| task.name.clone())
            .collect();

        let mut runnable = Vec::with_capacity(candidates.len());
        for name in candidates {
            let allowed = match workflow.tasks.get(&name).and_then(|t| t.condition.as_ref()) {
                Some(condition) => condition(&state.results),
                None => true,
            };

            if allowed {
                runnable.push(name);
            } else {
                info!("Task {} condition not met, skipping", name);
                self.mark_skipped(workflow, state, &name, SkipReason::Condition);
            }
        }
        runnable
    }

    /// Skip every pending task that depends on a failed or skipped task.
    /// Returns how many tasks were skipped in this pass.
    fn propagate_skips(&self, workflow: &mut Workflow, state: &mut RunState) -> usize {
        let doomed: Vec<(String, SkipReason)> = workflow
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter_map(|task| {
                task.dependencies.iter().find_map(|dep| {
                    if state.failed.contains(dep) {
                        Some((task.name.clone(), SkipReason::DependencyFailed(dep.clone())))
                    } else if state.skipped.contains(dep) {
                        Some((task.name.clone(), SkipReason::DependencySkipped(dep.clone())))
                    } else {
                        None
                    }
                })
            })
            .collect();

        let count = doomed.len();
        for (name, reason) in doomed {
            info!("Task {} skipped: {}", name, reason);
            self.mark_skipped(workflow, state, &name, reason);
        }
        count
    }

    fn skip_pending(&self, workflow: &mut Workflow, state: &mut RunState, reason: SkipReason) {
        let pending: Vec<String> = workflow
            .tasks_with_status(TaskStatus::Pending)
            .into_iter()
            .map(String::from)
            .collect();
        for name in pending {
            self.mark_skipped(workflow, state, &name, reason.clone());
        }
    }

    fn mark_skipped(
        &self,
        workflow: &mut Workflow,
        state: &mut RunState,
        name: &str,
        reason: SkipReason,
    ) {
        if let Some(task) = workflow.tasks.get_mut(name) {
            task.status = TaskStatus::Skipped;
            task.error = Some(reason.to_string());
        }
        self.board.set(name, TaskStatus::Skipped);
        self.emit(
            Event::new(name, TaskStatus::Skipped.to_string()).with("reason", reason.to_string()),
        );
        workflow
            .task_results
            .insert(name.to_string(), TaskResult::skipped(name.to_string(), reason));
        state.skipped.insert(name.to_string());
    }

    fn prepare_wave(&self, workflow: &mut Workflow, runnable: &[String]) -> Vec<Invocation> {
        let default_retry = workflow.default_retry.clone();
        runnable
            .iter()
            .filter_map(|name| {
                let task = workflow.tasks.get_mut(name)?;
                task.status = TaskStatus::Running;
                self.board.set(name, TaskStatus::Running);
                self.emit(Event::new(name.clone(), TaskStatus::Running.to_string()));

                Some(Invocation {
                    name: name.clone(),
                    action: Arc::clone(&task.action),
                    args: task.args.clone(),
                    timeout: task.timeout,
                    retry_policy: task
                        .retry_policy
                        .clone()
                        .or_else(|| default_retry.clone())
                        .unwrap_or_else(RetryPolicy::none),
                    board: self.board.clone(),
                })
            })
            .collect()
    }

    /// Record a finished task. Returns true if the task failed.
    fn record_outcome(
        &self,
        workflow: &mut Workflow,
        state: &mut RunState,
        outcome: InvocationOutcome,
    ) -> bool {
        let Some(task) = workflow.tasks.get_mut(&outcome.name) else {
            return false;
        };
        task.attempts = outcome.attempts;
        task.execution_time = Some(outcome.execution_time);
        let settled = if outcome.result.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.board.set(&outcome.name, settled);

        match outcome.result {
            Ok(raw) => {
                let value = match &task.transform_result {
                    Some(transform) => match transform(raw.clone()) {
                        Ok(transformed) => transformed,
                        Err(e) => {
                            warn!(
                                "Result transform for task {} failed, keeping original value: {}",
                                task.name, e
                            );
                            raw
                        }
                    },
                    None => raw,
                };

                task.status = TaskStatus::Completed;
                task.result = Some(value.clone());
                info!("Task {} completed successfully", task.name);

                workflow.task_results.insert(
                    outcome.name.clone(),
                    TaskResult::completed(
                        outcome.name.clone(),
                        value.clone(),
                        outcome.attempts,
                        outcome.started_at,
                        outcome.execution_time,
                    ),
                );
                self.emit(
                    Event::new(outcome.name.clone(), TaskStatus::Completed.to_string())
                        .with("attempts", outcome.attempts)
                        .with("execution_ms", outcome.execution_time.as_millis() as u64),
                );
                state.results.insert(outcome.name.clone(), value);
                state.completed.insert(outcome.name);
                false
            }
            Err(task_error) => {
                let message = task_error.to_string();
                task.status = TaskStatus::Failed;
                task.error = Some(message.clone());
                error!(
                    "Task {} failed after {} attempt(s): {}",
                    task.name, outcome.attempts, message
                );

                workflow.task_results.insert(
                    outcome.name.clone(),
                    TaskResult::failed(
                        outcome.name.clone(),
                        message.clone(),
                        outcome.attempts,
                        outcome.started_at,
                        outcome.execution_time,
                    ),
                );
                self.emit(
                    Event::new(outcome.name.clone(), TaskStatus::Failed.to_string())
                        .with("error", message)
                        .with("error_kind", task_error.kind.to_string())
                        .with("attempts", outcome.attempts),
                );
                state.failed.insert(outcome.name);
                true
            }
        }
    }

    fn emit(&self, event: Event) {
        emit(self.observer.as_ref(), event);
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("max_concurrency", &self.dispatcher.max_concurrent())
            .finish()
    }
}
