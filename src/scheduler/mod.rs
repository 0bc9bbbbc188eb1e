// ABOUTME: Priority-ordered job scheduler for flat, non-dependent job sets
// ABOUTME: Starts jobs in ascending priority order behind a counting semaphore and records their outcomes

pub mod job;
pub mod metrics;

pub use job::{AsyncJob, JobId, JobStatus};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::config::Config;
use crate::engine::dispatch::execute_attempt;
use crate::engine::{
    action_fn, emit, Action, ActionResult, ExecutionContext, Event, Observer, TaskError,
};

pub struct PriorityScheduler {
    name: String,
    max_concurrency: Option<usize>,
    jobs: IndexMap<JobId, AsyncJob>,
    metrics: Arc<SchedulerMetrics>,
    observer: Option<Arc<dyn Observer>>,
}

struct JobOutcome {
    result: ActionResult,
    elapsed: Duration,
    completed_at: DateTime<Utc>,
}

impl PriorityScheduler {
    /// Create a scheduler; `None` means unbounded concurrency.
    pub fn new(max_concurrency: Option<usize>) -> Self {
        Self {
            name: "scheduler".to_string(),
            max_concurrency: max_concurrency.map(|n| n.max(1)),
            jobs: IndexMap::new(),
            metrics: Arc::new(SchedulerMetrics::default()),
            observer: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_concurrency)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Queue a job and return its id. Lower `priority` values start sooner.
    pub fn schedule(
        &mut self,
        action: Arc<dyn Action>,
        args: Value,
        priority: i64,
        name: Option<String>,
    ) -> JobId {
        let name = name.unwrap_or_else(|| format!("job-{}", self.jobs.len() + 1));
        let job = AsyncJob::new(name, action, args, priority);
        let id = job.id;

        debug!("Scheduled job {} ({}) with priority {}", job.name, id, priority);
        self.notify(
            Event::new(job.name.clone(), "scheduled")
                .with("job_id", id.to_string())
                .with("priority", priority),
        );
        self.jobs.insert(id, job);
        self.metrics.record_scheduled();
        id
    }

    /// Convenience wrapper around [`schedule`](Self::schedule) for async closures.
    pub fn schedule_fn<F, Fut>(&mut self, name: &str, priority: i64, func: F) -> JobId
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.schedule(action_fn(func), Value::Null, priority, Some(name.to_string()))
    }

    /// Set a per-job timeout. Only applies to jobs that have not started.
    pub fn set_timeout(&mut self, id: JobId, timeout: Duration) -> bool {
        match self.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.timeout = Some(timeout);
                true
            }
            _ => false,
        }
    }

    /// Cancel a job that has not started yet.
    pub fn cancel(&mut self, id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobStatus::Pending {
            return false;
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        let name = job.name.clone();
        self.metrics.record_cancelled();
        info!("Cancelled job {} ({})", name, id);
        self.notify(Event::new(name, "cancelled").with("job_id", id.to_string()));
        true
    }

    /// Run every pending job and return all jobs known to the scheduler.
    ///
    /// Jobs acquire the concurrency gate in ascending priority order (ties
    /// keep scheduling order). Job failures are recorded, never returned.
    #[instrument(skip(self), fields(scheduler = %self.name))]
    pub async fn run_all(&mut self) -> HashMap<JobId, AsyncJob> {
        let mut order: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.id)
            .collect();
        order.sort_by_key(|id| self.jobs[id].priority);

        info!(
            "Running {} pending jobs (max concurrency: {:?})",
            order.len(),
            self.max_concurrency
        );

        let gate = Arc::new(Semaphore::new(
            self.max_concurrency.unwrap_or(Semaphore::MAX_PERMITS),
        ));
        let base_context = ExecutionContext::new(uuid::Uuid::new_v4().to_string(), self.name.clone());
        let mut handles = Vec::with_capacity(order.len());

        for id in order {
            let permit = Arc::clone(&gate).acquire_owned().await.ok();

            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            debug!("Starting job {} (priority {})", job.name, job.priority);

            let action = Arc::clone(&job.action);
            let context = base_context.for_subject(job.name.clone(), job.args.clone());
            let limit = job.timeout;
            let name = job.name.clone();
            let metrics = Arc::clone(&self.metrics);
            let observer = self.observer.clone();

            if let Some(observer) = &observer {
                emit(
                    observer.as_ref(),
                    Event::new(name.clone(), "started").with("job_id", id.to_string()),
                );
            }

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let clock = Instant::now();
                let result = execute_attempt(action, context, limit).await;
                let elapsed = clock.elapsed();

                metrics.record_finished(result.is_ok(), elapsed);
                if let Some(observer) = &observer {
                    let event = match &result {
                        Ok(_) => Event::new(name, "completed"),
                        Err(e) => Event::new(name, "failed").with("error", e.to_string()),
                    };
                    emit(
                        observer.as_ref(),
                        event
                            .with("job_id", id.to_string())
                            .with("execution_ms", elapsed.as_millis() as u64),
                    );
                }

                JobOutcome {
                    result,
                    elapsed,
                    completed_at: Utc::now(),
                }
            });
            handles.push((id, handle));
        }

        let (ids, handles): (Vec<JobId>, Vec<_>) = handles.into_iter().unzip();
        let outcomes = join_all(handles).await;

        for (id, joined) in ids.into_iter().zip(outcomes) {
            let outcome = joined.unwrap_or_else(|e| JobOutcome {
                result: Err(TaskError::from_join(e)),
                elapsed: Duration::ZERO,
                completed_at: Utc::now(),
            });
            self.record(id, outcome);
        }

        self.jobs.iter().map(|(id, job)| (*id, job.clone())).collect()
    }

    fn record(&mut self, id: JobId, outcome: JobOutcome) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        job.completed_at = Some(outcome.completed_at);

        match outcome.result {
            Ok(value) => {
                job.status = JobStatus::Completed;
                job.result = Some(value);
                debug!("Job {} completed in {:?}", job.name, outcome.elapsed);
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                error!("Job {} failed: {}", job.name, e);
            }
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn job(&self, id: JobId) -> Option<&AsyncJob> {
        self.jobs.get(&id)
    }

    /// Jobs in scheduling order.
    pub fn jobs(&self) -> impl Iterator<Item = &AsyncJob> {
        self.jobs.values()
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn notify(&self, event: Event) {
        if let Some(observer) = &self.observer {
            emit(observer.as_ref(), event);
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(None)
    }
}
