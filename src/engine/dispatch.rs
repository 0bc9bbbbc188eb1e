// ABOUTME: Wave dispatch with bounded concurrency, per-task timeouts and retry/backoff handling
// ABOUTME: Runs every task of a wave on its own tokio task and joins them as a single barrier

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::error::TaskError;
use super::observer::{emit, Event, Observer};
use super::result::TaskStatus;
use super::retry::RetryPolicy;
use super::task::{Action, ActionResult};

/// Live task statuses shared between the engine and in-flight waves.
///
/// Workflow tasks are only mutated between waves; this board tracks the
/// transitions that happen inside one (`Running` <-> `Retrying`).
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    statuses: Arc<Mutex<HashMap<String, TaskStatus>>>,
}

impl StatusBoard {
    pub fn set(&self, name: &str, status: TaskStatus) {
        match self.statuses.lock() {
            Ok(mut statuses) => {
                statuses.insert(name.to_string(), status);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), status);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<TaskStatus> {
        match self.statuses.lock() {
            Ok(statuses) => statuses.get(name).copied(),
            Err(poisoned) => poisoned.into_inner().get(name).copied(),
        }
    }

    pub fn clear(&self) {
        match self.statuses.lock() {
            Ok(mut statuses) => statuses.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

/// Everything needed to execute one task of a wave.
pub struct Invocation {
    pub name: String,
    pub action: Arc<dyn Action>,
    pub args: Value,
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub board: StatusBoard,
}

#[derive(Debug)]
pub struct InvocationOutcome {
    pub name: String,
    pub result: ActionResult,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub execution_time: Duration,
}

/// Aborts the wrapped tokio task when dropped, so cancelling the awaiting
/// future also cancels the action it is waiting on.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one attempt of an action on its own tokio task, optionally bounded
/// by a timeout. Panics surface as `Panicked` errors, timeouts as `Timeout`.
pub(crate) async fn execute_attempt(
    action: Arc<dyn Action>,
    context: ExecutionContext,
    limit: Option<Duration>,
) -> ActionResult {
    let mut guard = AbortOnDrop(tokio::spawn(async move { action.call(context).await }));

    match limit {
        Some(limit) => match timeout(limit, &mut guard.0).await {
            Ok(joined) => joined.unwrap_or_else(|e| Err(TaskError::from_join(e))),
            Err(_) => Err(TaskError::timeout(limit)),
        },
        None => (&mut guard.0)
            .await
            .unwrap_or_else(|e| Err(TaskError::from_join(e))),
    }
}

pub struct WaveDispatcher {
    max_concurrent: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
}

impl WaveDispatcher {
    /// Create a dispatcher; `None` leaves waves unbounded.
    pub fn new(max_concurrent: Option<usize>) -> Self {
        let max_concurrent = max_concurrent.map(|n| n.max(1));
        Self {
            max_concurrent,
            semaphore: max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    /// Execute a wave concurrently and wait for every member to finish.
    /// Outcomes are returned in the order of `wave`.
    pub async fn execute_wave(
        &self,
        wave: Vec<Invocation>,
        base_context: &ExecutionContext,
        observer: &Arc<dyn Observer>,
    ) -> Vec<InvocationOutcome> {
        if wave.is_empty() {
            return Vec::new();
        }

        info!("Executing wave of {} tasks", wave.len());

        let futures = wave.into_iter().map(|invocation| {
            let context = base_context.for_subject(invocation.name.clone(), invocation.args.clone());
            let gate = self.semaphore.clone();
            let observer = Arc::clone(observer);

            async move { Self::execute_with_retry(invocation, context, gate, observer).await }
        });

        let outcomes = join_all(futures).await;
        debug!("Wave completed. {} outcomes", outcomes.len());
        outcomes
    }

    /// Execute a single task, re-attempting retryable failures with backoff.
    /// The concurrency permit is released while sleeping between attempts.
    pub async fn execute_with_retry(
        invocation: Invocation,
        context: ExecutionContext,
        gate: Option<Arc<Semaphore>>,
        observer: Arc<dyn Observer>,
    ) -> InvocationOutcome {
        let policy = &invocation.retry_policy;
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = {
                let _permit = match &gate {
                    Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                    None => None,
                };

                debug!(
                    "Executing task {} (attempt {}/{})",
                    invocation.name, attempt, policy.max_attempts
                );

                execute_attempt(
                    Arc::clone(&invocation.action),
                    context.clone().with_attempt(attempt),
                    invocation.timeout,
                )
                .await
            };

            match result {
                Err(error) if policy.should_retry(attempt, &error) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        "Task {} failed on attempt {}: {}; retrying in {:?}",
                        invocation.name, attempt, error, delay
                    );
                    emit(
                        observer.as_ref(),
                        Event::new(invocation.name.clone(), "retrying")
                            .with("attempt", attempt)
                            .with("error", error.to_string())
                            .with("delay_ms", delay.as_millis() as u64),
                    );
                    invocation.board.set(&invocation.name, TaskStatus::Retrying);
                    sleep(delay).await;
                    invocation.board.set(&invocation.name, TaskStatus::Running);
                }
                result => {
                    return InvocationOutcome {
                        name: invocation.name,
                        result,
                        attempts: attempt,
                        started_at,
                        execution_time: clock.elapsed(),
                    };
                }
            }
        }
    }
}
