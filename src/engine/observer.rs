// ABOUTME: Lifecycle event observers for workflows, scheduled jobs and fan-out units
// ABOUTME: Delivers non-blocking notifications and isolates the caller from observer errors and panics

use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A single lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub subject: String,
    pub status: String,
    pub detail: Map<String, Value>,
}

impl Event {
    pub fn new(subject: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            status: status.into(),
            detail: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

/// Sink for lifecycle events. Implementations must not block.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Deliver an event, logging (never propagating) observer errors and panics.
pub fn emit(observer: &dyn Observer, event: Event) {
    match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            "Observer failed on '{}' ({}): {}",
            event.subject, event.status, e
        ),
        Err(_) => warn!(
            "Observer panicked on '{}' ({})",
            event.subject, event.status
        ),
    }
}

/// Default observer: writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        let detail = Value::Object(event.detail.clone());
        debug!(
            subject = %event.subject,
            status = %event.status,
            detail = %detail,
            "lifecycle event"
        );
        Ok(())
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

/// Observer backed by a closure.
pub struct FnObserver<F> {
    func: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        (self.func)(event)
    }
}
