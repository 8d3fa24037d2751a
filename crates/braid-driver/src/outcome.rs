use std::fmt;

use braid_graph::NodeResult;
use braid_store::JobState;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::DriverError;

/// Batch failure ratio at the moment a job failed on tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceContext {
  pub failed: usize,
  pub total: usize,
  pub percent: f64,
  pub tolerance: f64,
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_id: Option<String>,
  /// The originating error, verbatim.
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tolerance: Option<ToleranceContext>,
}

impl JobFailure {
  pub(crate) fn task(node: &str, task_id: &str, error: impl Into<String>) -> Self {
    Self {
      node: Some(node.to_string()),
      task_id: Some(task_id.to_string()),
      error: error.into(),
      tolerance: None,
    }
  }

  pub(crate) fn node(node: &str, error: impl Into<String>) -> Self {
    Self {
      node: Some(node.to_string()),
      task_id: None,
      error: error.into(),
      tolerance: None,
    }
  }

  pub(crate) fn internal(error: impl Into<String>) -> Self {
    Self {
      node: None,
      task_id: None,
      error: error.into(),
      tolerance: None,
    }
  }
}

impl fmt::Display for JobFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.error)?;
    if let (Some(node), Some(t)) = (&self.node, &self.tolerance) {
      write!(
        f,
        " ({}/{} tasks of '{}' failed, {:.2}% exceeds batch tolerance of {}%)",
        t.failed, t.total, node, t.percent, t.tolerance
      )?;
    }
    Ok(())
  }
}

/// Final result of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
  pub job_id: String,
  pub state: JobState,
  /// Per-task results, present when the job completed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub results: Option<Vec<NodeResult>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<JobFailure>,
}

impl JobOutcome {
  pub(crate) fn completed(job_id: &str, results: Vec<NodeResult>) -> Self {
    Self {
      job_id: job_id.to_string(),
      state: JobState::Completed,
      results: Some(results),
      failure: None,
    }
  }

  pub(crate) fn failed(job_id: &str, failure: JobFailure) -> Self {
    Self {
      job_id: job_id.to_string(),
      state: JobState::Failed,
      results: None,
      failure: Some(failure),
    }
  }

  pub(crate) fn stopped(job_id: &str) -> Self {
    Self {
      job_id: job_id.to_string(),
      state: JobState::Stopped,
      results: None,
      failure: None,
    }
  }
}

/// A handle to a running job.
///
/// Call `.wait()` to get the job's outcome.
#[derive(Debug)]
pub struct JobHandle {
  job_id: String,
  outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
  pub(crate) fn new(job_id: String, outcome: oneshot::Receiver<JobOutcome>) -> Self {
    Self { job_id, outcome }
  }

  pub fn job_id(&self) -> &str {
    &self.job_id
  }

  /// Wait for the job to reach a final state.
  pub async fn wait(self) -> Result<JobOutcome, DriverError> {
    self
      .outcome
      .await
      .map_err(|_| DriverError::JobAborted { job_id: self.job_id })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_failure_message_carries_tolerance() {
    let mut failure = JobFailure::task("green", "echo:1", "disk full");
    assert_eq!(failure.to_string(), "disk full");

    failure.tolerance = Some(ToleranceContext {
      failed: 2,
      total: 3,
      percent: 200.0 / 3.0,
      tolerance: 34.0,
    });
    assert_eq!(
      failure.to_string(),
      "disk full (2/3 tasks of 'green' failed, 66.67% exceeds batch tolerance of 34%)"
    );
  }
}
