//! Braid Store
//!
//! Persistence for running and finished jobs. Data lives in a database
//! (SQLite) or, for tests and embedded use, in memory.
//!
//! The [`StateStore`] trait covers:
//! - The job record: pipeline, lifecycle state, final results or error
//! - Task records, one per dispatched task, upserted on every change
//! - The latest graph snapshot of each job

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use types::{JobRecord, JobState};

use async_trait::async_trait;
use braid_graph::NodeState;
use serde_json::Value;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Migrations could not be applied.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// A stored value could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Storage trait for jobs, tasks and graph snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
  /// Get a job record by ID.
  async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

  /// Insert or replace a job record.
  async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError>;

  /// Move a job to a new lifecycle state, optionally recording results or an error.
  async fn update_job_state(
    &self,
    job_id: &str,
    state: JobState,
    results: Option<&Value>,
    error: Option<&str>,
  ) -> Result<(), StoreError>;

  /// Insert or update a task record.
  async fn put_task(&self, job_id: &str, task: &NodeState) -> Result<(), StoreError>;

  /// List task records of a job in insertion order.
  async fn list_tasks(&self, job_id: &str) -> Result<Vec<NodeState>, StoreError>;

  /// Replace the graph snapshot of a job.
  async fn put_graph(&self, job_id: &str, graph: &Value) -> Result<(), StoreError>;

  /// Get the latest graph snapshot of a job.
  async fn get_graph(&self, job_id: &str) -> Result<Option<Value>, StoreError>;
}
