//! Per-worker execution context.

use serde_json::{Map, Value};

/// Context key holding the id of the worker running the task.
pub const WORKER_ID_KEY: &str = "worker_id";

/// Context counter of poll attempts made by the worker so far.
pub const POLLS_KEY: &str = "polls";

/// Free-form bag handed to every task body a worker runs.
///
/// A worker owns one context for its whole lifetime, so task bodies can
/// accumulate counters and metadata across executions. It is never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskContext {
    values: Map<String, Value>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Add one to an integer counter and return the new value.
    ///
    /// Missing or non-integer entries count as zero.
    pub fn increment(&mut self, key: &str) -> i64 {
        let next = self.counter(key) + 1;
        self.values.insert(key.to_string(), Value::from(next));
        next
    }

    /// Current value of an integer counter.
    pub fn counter(&self, key: &str) -> i64 {
        self.values.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for TaskContext {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}
