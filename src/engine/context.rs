// ABOUTME: Execution context handed to every action, job and fan-out unit
// ABOUTME: Carries run identity, attempt number, arguments and a read-only snapshot of prior results

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::TaskError;

pub type ResultsSnapshot = Arc<HashMap<String, Value>>;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    /// Name of the owning workflow, scheduler or fan-out batch.
    pub scope: String,
    /// Name of the task, job or unit being executed.
    pub subject: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    pub args: Value,
    pub results: ResultsSnapshot,
    pub metadata: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            scope: scope.into(),
            subject: String::new(),
            attempt: 1,
            start_time: Utc::now(),
            args: Value::Null,
            results: Arc::new(HashMap::new()),
            metadata: HashMap::new(),
        }
    }

    pub fn for_subject(&self, subject: impl Into<String>, args: Value) -> Self {
        Self {
            run_id: self.run_id.clone(),
            scope: self.scope.clone(),
            subject: subject.into(),
            attempt: 1,
            start_time: Utc::now(),
            args,
            results: Arc::clone(&self.results),
            metadata: self.metadata.clone(),
        }
    }

    pub fn with_results(mut self, results: ResultsSnapshot) -> Self {
        self.results = results;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self.start_time = Utc::now();
        self
    }

    pub fn add_metadata(&mut self, key: String, value: String) {
        self.metadata.insert(key, value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&String> {
        self.metadata.get(key)
    }

    /// Value produced by a previously completed task.
    pub fn result(&self, task: &str) -> Option<&Value> {
        self.results.get(task)
    }

    /// Deserialize a single keyed argument from an object-shaped `args`.
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, TaskError> {
        let raw = self.args.get(key).cloned().ok_or_else(|| {
            TaskError::other("argument", format!("missing argument '{}'", key))
        })?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Deserialize the whole `args` value.
    pub fn args_as<T: DeserializeOwned>(&self) -> std::result::Result<T, TaskError> {
        Ok(serde_json::from_value(self.args.clone())?)
    }
}
