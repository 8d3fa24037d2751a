use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Creating,
  Pending,
  Active,
  Completed,
  Failed,
  Stopped,
}

impl TaskStatus {
  /// Whether no further transitions are expected.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Creating => "creating",
      TaskStatus::Pending => "pending",
      TaskStatus::Active => "active",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Stopped => "stopped",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Runtime record of one unit of work dispatched for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
  pub task_id: String,
  pub node_name: String,
  pub algorithm_name: String,
  /// Present only for batch elements.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_index: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input: Option<Vec<Value>>,
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub retries: u32,
  pub start_time: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
}

impl NodeState {
  pub fn new(
    task_id: impl Into<String>,
    node_name: impl Into<String>,
    algorithm_name: impl Into<String>,
    batch_index: Option<usize>,
  ) -> Self {
    Self {
      task_id: task_id.into(),
      node_name: node_name.into(),
      algorithm_name: algorithm_name.into(),
      batch_index,
      input: None,
      status: TaskStatus::Creating,
      result: None,
      error: None,
      retries: 0,
      start_time: Utc::now(),
      end_time: None,
    }
  }

  pub fn with_input(mut self, input: Vec<Value>) -> Self {
    self.input = Some(input);
    self
  }

  /// Merge a partial update into this state.
  ///
  /// Returns `false` (and leaves the state untouched) when the state is
  /// already terminal and the patch would change status or result.
  pub(crate) fn apply(&mut self, patch: NodePatch) -> bool {
    if self.status.is_terminal() && patch.changes_outcome() {
      return false;
    }
    if let Some(input) = patch.input {
      self.input = Some(input);
    }
    if let Some(result) = patch.result {
      self.result = Some(result);
    }
    if let Some(error) = patch.error {
      self.error = Some(error);
    }
    if let Some(retries) = patch.retries {
      self.retries = retries;
    }
    if let Some(status) = patch.status {
      self.status = status;
      if status.is_terminal() && self.end_time.is_none() {
        self.end_time = Some(patch.end_time.unwrap_or_else(Utc::now));
      }
    }
    true
  }
}

/// A partial update to a [`NodeState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
  pub input: Option<Vec<Value>>,
  pub status: Option<TaskStatus>,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub retries: Option<u32>,
  /// Overrides the end timestamp stamped on a terminal transition.
  pub end_time: Option<DateTime<Utc>>,
}

impl NodePatch {
  pub fn status(status: TaskStatus) -> Self {
    Self {
      status: Some(status),
      ..Default::default()
    }
  }

  pub fn completed(result: Value) -> Self {
    Self {
      status: Some(TaskStatus::Completed),
      result: Some(result),
      ..Default::default()
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      status: Some(TaskStatus::Failed),
      error: Some(error.into()),
      ..Default::default()
    }
  }

  pub fn input(input: Vec<Value>) -> Self {
    Self {
      input: Some(input),
      ..Default::default()
    }
  }

  fn changes_outcome(&self) -> bool {
    self.status.is_some() || self.result.is_some() || self.error.is_some()
  }
}
