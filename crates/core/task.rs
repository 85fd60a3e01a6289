//! Task record and related types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, RowqError};

/// Priority given to tasks inserted without an explicit one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Store-assigned identifier of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// The status of a task.
///
/// Tasks move `New -> InProgress -> {Success | Failed}`. Only the
/// maintenance operations move a task back to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    New,
    /// Claimed by a worker.
    InProgress,
    /// Task body returned normally.
    Success,
    /// Task body returned an error or panicked.
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::New,
        TaskStatus::InProgress,
        TaskStatus::Success,
        TaskStatus::Failed,
    ];

    /// The value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RowqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "new" => Ok(TaskStatus::New),
            "in_progress" | "in-progress" => Ok(TaskStatus::InProgress),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(RowqError::Config(format!("unknown task status '{}'", other))),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identity.
    pub id: TaskId,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Diagnostic text of the last failure.
    pub fail_reason: Option<String>,
    /// When the task was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task body finished, successfully or not.
    pub terminated_at: Option<DateTime<Utc>>,
    /// Set on insertion, never changed.
    pub created_at: DateTime<Utc>,
    /// Discriminator selecting the task kind that runs this task.
    pub kind: String,
    /// Kind-specific data.
    pub payload: serde_json::Value,
}

impl Task {
    /// Decode the payload into the kind's own type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A task as handed to [`TaskStore::insert_task`](crate::TaskStore::insert_task).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: String,
    pub priority: i32,
    pub payload: serde_json::Value,
}

impl NewTask {
    /// Create a task of the given kind with the default priority and an
    /// empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            priority: DEFAULT_PRIORITY,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload from any serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// The payload as stored in the `payload` column.
    pub fn payload_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: u64,
    pub in_progress: u64,
    pub success: u64,
    pub failed: u64,
}

impl StatusCounts {
    /// Add `count` tasks of `status`.
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::New => self.new += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Success => self.success += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.in_progress + self.success + self.failed
    }
}
