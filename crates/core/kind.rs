//! Task kinds: the behavior behind a task's `type` discriminator.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::error::{Result, RowqError};
use crate::task::Task;

/// Result type for task bodies.
pub type TaskResult = std::result::Result<(), TaskError>;

/// Error returned from a task body.
///
/// The message ends up in the task's `fail_reason` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for TaskError {
    fn from(err: E) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str("\ncaused by: ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { message }
    }
}

/// One concrete kind of task.
///
/// `S` is the store session the body runs in. Writes made through it commit
/// together with the task's `success` status, or are rolled back when the
/// body fails.
#[async_trait]
pub trait TaskKind<S: Send>: Send + Sync {
    /// Value of the `type` column this kind handles.
    fn kind(&self) -> &'static str;

    /// Run the task. Failures must be returned, not swallowed.
    ///
    /// Database work belongs on `session`. The session holds one of the
    /// store's pooled connections until the task finishes, so going through
    /// the store or a [`Client`](crate::Client) here waits on a second
    /// connection, and on a single-connection store (SQLite) never gets one.
    async fn run(&self, task: &Task, ctx: &mut TaskContext, session: &mut S) -> TaskResult;
}

/// Registry of task kinds keyed by `type`.
///
/// Built during startup, shared read-only by workers afterwards.
pub struct TaskRegistry<S: Send> {
    kinds: HashMap<&'static str, Arc<dyn TaskKind<S>>>,
}

impl<S: Send> Default for TaskRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send> TaskRegistry<S> {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Register a task kind. Each `type` may be registered once.
    pub fn register<K: TaskKind<S> + 'static>(&mut self, kind: K) -> Result<()> {
        let name = kind.kind();
        if self.kinds.contains_key(name) {
            return Err(RowqError::DuplicateKind(name.to_string()));
        }
        self.kinds.insert(name, Arc::new(kind));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<K: TaskKind<S> + 'static>(mut self, kind: K) -> Result<Self> {
        self.register(kind)?;
        Ok(self)
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskKind<S>>> {
        self.kinds.get(kind).cloned()
    }

    /// Registered `type` values, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.kinds.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
