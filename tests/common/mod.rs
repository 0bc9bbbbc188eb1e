// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides task factories, timeline recorders and event collection helpers

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use wavefront::engine::{Event, ExecutionContext, Task, TaskError};

/// Shared, ordered log of "<name>:start" / "<name>:end" markers.
#[derive(Clone, Default)]
pub struct Timeline {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

/// A task that returns `value` without doing anything else.
pub fn value_task(name: &str, value: Value) -> Task {
    Task::from_fn(name, move |_ctx: ExecutionContext| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// A task that records its start and end, sleeping in between.
pub fn timed_task(name: &str, timeline: &Timeline, millis: u64) -> Task {
    let timeline = timeline.clone();
    let label = name.to_string();
    Task::from_fn(name, move |_ctx: ExecutionContext| {
        let timeline = timeline.clone();
        let label = label.clone();
        async move {
            timeline.push(format!("{}:start", label));
            tokio::time::sleep(Duration::from_millis(millis)).await;
            timeline.push(format!("{}:end", label));
            Ok(json!(format!("{} done", label)))
        }
    })
}

/// A task that always fails with a non-retryable error.
pub fn failing_task(name: &str) -> Task {
    Task::from_fn(name, |_ctx: ExecutionContext| async {
        Err(TaskError::other("test", "deliberate failure"))
    })
}

/// A task that counts its invocations and always fails with `error`.
pub fn counting_failure(name: &str, calls: &Arc<AtomicU32>, error: TaskError) -> Task {
    let calls = Arc::clone(calls);
    Task::from_fn(name, move |_ctx: ExecutionContext| {
        let calls = Arc::clone(&calls);
        let error = error.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(error)
        }
    })
}

/// A task that counts its invocations and succeeds.
pub fn counting_task(name: &str, calls: &Arc<AtomicU32>) -> Task {
    let calls = Arc::clone(calls);
    Task::from_fn(name, move |_ctx: ExecutionContext| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    })
}

/// Drain every event currently buffered in an observer channel.
pub fn drain_events(receiver: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub fn has_event(events: &[Event], subject: &str, status: &str) -> bool {
    events
        .iter()
        .any(|e| e.subject == subject && e.status == status)
}
