//! The task dispatch contract and task lifecycle events.

use async_trait::async_trait;
use braid_graph::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work handed to the dispatch service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
  pub job_id: String,
  pub task_id: String,
  pub node_name: String,
  pub algorithm_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_index: Option<usize>,
  pub input: Vec<Value>,
}

/// A task as currently observed by the dispatch service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTask {
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Error reported by the dispatch service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dispatch failed: {message}")]
pub struct DispatchError {
  pub message: String,
}

impl DispatchError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// Creates tasks on workers and tracks their lifecycle.
///
/// Lifecycle events for watched tasks are delivered back through
/// [`Driver::task_event`](crate::Driver::task_event).
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
  /// Submit a task for execution.
  async fn create_task(&self, request: TaskRequest) -> Result<(), DispatchError>;

  /// Start delivering lifecycle events for a task.
  async fn watch_task(&self, job_id: &str, task_id: &str) -> Result<(), DispatchError>;

  /// Stop delivering lifecycle events for a task.
  async fn unwatch_task(&self, job_id: &str, task_id: &str) -> Result<(), DispatchError>;

  /// The task's current status, `None` if the service has no record of it.
  async fn task_status(
    &self,
    job_id: &str,
    task_id: &str,
  ) -> Result<Option<ObservedTask>, DispatchError>;
}

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskEventKind {
  /// Queued, waiting for a worker.
  Waiting,
  /// Picked up by a worker.
  Active,
  Completed { result: Value },
  Failed { error: String },
}

/// A lifecycle event for one task of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
  pub job_id: String,
  pub task_id: String,
  #[serde(flatten)]
  pub kind: TaskEventKind,
}

impl TaskEvent {
  pub fn waiting(job_id: impl Into<String>, task_id: impl Into<String>) -> Self {
    Self::new(job_id, task_id, TaskEventKind::Waiting)
  }

  pub fn active(job_id: impl Into<String>, task_id: impl Into<String>) -> Self {
    Self::new(job_id, task_id, TaskEventKind::Active)
  }

  pub fn completed(job_id: impl Into<String>, task_id: impl Into<String>, result: Value) -> Self {
    Self::new(job_id, task_id, TaskEventKind::Completed { result })
  }

  pub fn failed(
    job_id: impl Into<String>,
    task_id: impl Into<String>,
    error: impl Into<String>,
  ) -> Self {
    Self::new(
      job_id,
      task_id,
      TaskEventKind::Failed {
        error: error.into(),
      },
    )
  }

  fn new(job_id: impl Into<String>, task_id: impl Into<String>, kind: TaskEventKind) -> Self {
    Self {
      job_id: job_id.into(),
      task_id: task_id.into(),
      kind,
    }
  }
}

impl ObservedTask {
  /// The event that moves a task to this observed state, if any.
  pub fn into_event_kind(self) -> Option<TaskEventKind> {
    match self.status {
      TaskStatus::Completed => Some(TaskEventKind::Completed {
        result: self.result.unwrap_or(Value::Null),
      }),
      TaskStatus::Failed => Some(TaskEventKind::Failed {
        error: self.error.unwrap_or_else(|| "task failed".to_string()),
      }),
      TaskStatus::Stopped => Some(TaskEventKind::Failed {
        error: self.error.unwrap_or_else(|| "task stopped".to_string()),
      }),
      TaskStatus::Pending => Some(TaskEventKind::Waiting),
      TaskStatus::Active => Some(TaskEventKind::Active),
      TaskStatus::Creating => None,
    }
  }
}
