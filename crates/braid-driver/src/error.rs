//! Driver errors.

use braid_graph::GraphError;
use braid_resolver::ResolveError;
use braid_store::StoreError;

/// Errors that can occur while starting or driving a job.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
  /// The pipeline does not form a valid graph.
  #[error("invalid pipeline: {0}")]
  Graph(#[from] GraphError),

  /// Node input could not be resolved.
  #[error("input resolution failed: {0}")]
  Resolve(#[from] ResolveError),

  /// The persistence backend failed.
  #[error("store error: {0}")]
  Store(#[from] StoreError),

  /// The effective batch tolerance is not a percentage.
  #[error("batch tolerance must be within 0-100, got {tolerance}")]
  InvalidTolerance { tolerance: f64 },

  /// A job with this id is already running in this driver.
  #[error("job '{job_id}' is already running")]
  JobAlreadyRunning { job_id: String },

  /// A task event points at a node that is not part of the job's graph.
  #[error("task '{task_id}' references unknown node '{node}'")]
  UnknownNode { task_id: String, node: String },

  /// The job's event loop went away without reporting an outcome.
  #[error("job '{job_id}' ended without an outcome")]
  JobAborted { job_id: String },
}
