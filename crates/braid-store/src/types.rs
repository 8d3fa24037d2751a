use std::fmt;

use braid_config::Pipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
  Active,
  Recovering,
  Stopped,
  Completed,
  Failed,
}

impl JobState {
  pub fn is_final(self) -> bool {
    matches!(
      self,
      JobState::Stopped | JobState::Completed | JobState::Failed
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobState::Active => "active",
      JobState::Recovering => "recovering",
      JobState::Stopped => "stopped",
      JobState::Completed => "completed",
      JobState::Failed => "failed",
    }
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A job as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
  pub job_id: String,
  pub pipeline: Pipeline,
  pub state: JobState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub results: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl JobRecord {
  /// A fresh record for a job that is about to start.
  pub fn new(job_id: impl Into<String>, pipeline: Pipeline) -> Self {
    let now = Utc::now();
    Self {
      job_id: job_id.into(),
      pipeline,
      state: JobState::Active,
      results: None,
      error: None,
      created_at: now,
      updated_at: now,
    }
  }
}
