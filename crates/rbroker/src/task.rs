//! Task identity and terminal results.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Unique identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("session corrupted: {0}")]
    SessionCorrupted(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error("task cancelled")]
    Cancelled,
    #[error("task aborted: {0}")]
    Aborted(String),
}

impl TaskError {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Timeout(_) => TaskStatus::TimedOut,
            Self::Cancelled => TaskStatus::Cancelled,
            Self::Failed(_) | Self::SessionCorrupted(_) | Self::Panicked(_) | Self::Aborted(_) => {
                TaskStatus::Failed
            }
        }
    }
}

/// Bookkeeping captured at admission and carried with the task until delivery.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub admitted: Instant,
}

impl TaskRecord {
    pub fn new(sequence: u64) -> Self {
        Self {
            id: TaskId::new(),
            sequence,
            submitted_at: Utc::now(),
            admitted: Instant::now(),
        }
    }

    /// Build the terminal result. `dispatched` is `None` for tasks that never
    /// left the queue.
    pub fn finish(
        &self,
        outcome: Result<serde_json::Value, TaskError>,
        session: Option<SessionId>,
        dispatched: Option<Instant>,
    ) -> TaskResult {
        let (time_on_queue, time_on_call) = match dispatched {
            Some(at) => (at.duration_since(self.admitted), at.elapsed()),
            None => (self.admitted.elapsed(), Duration::ZERO),
        };
        let (status, output, error) = match outcome {
            Ok(output) => (TaskStatus::Succeeded, Some(output), None),
            Err(e) => (e.status(), None, Some(e)),
        };

        TaskResult {
            id: self.id,
            sequence: self.sequence,
            status,
            output,
            error,
            session,
            submitted_at: self.submitted_at,
            time_on_queue,
            time_on_call,
        }
    }
}

/// Terminal outcome of a task. Exactly one is delivered per accepted submission.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: TaskId,
    /// Submission order; lower values were admitted first.
    pub sequence: u64,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    /// Session the task ran on, if it was dispatched.
    pub session: Option<SessionId>,
    pub submitted_at: DateTime<Utc>,
    pub time_on_queue: Duration,
    pub time_on_call: Duration,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn to_response(&self) -> serde_json::Value {
        let mut response = serde_json::json!({
            "id": self.id,
            "sequence": self.sequence,
            "status": self.status.as_str(),
            "submitted_at": self.submitted_at.to_rfc3339(),
            "metrics": {
                "time_on_queue": self.time_on_queue.as_secs_f64(),
                "time_on_call": self.time_on_call.as_secs_f64(),
            }
        });

        if let Some(ref output) = self.output {
            response["output"] = output.clone();
        }
        if let Some(ref error) = self.error {
            response["error"] = serde_json::Value::String(error.to_string());
        }
        if let Some(session) = self.session {
            response["session"] = serde_json::Value::String(session.to_string());
        }

        response
    }
}
