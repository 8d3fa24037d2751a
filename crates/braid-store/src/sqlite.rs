use std::path::Path;

use async_trait::async_trait;
use braid_config::Pipeline;
use braid_graph::{NodeState, TaskStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::{JobRecord, JobState, StateStore, StoreError};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and run migrations.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[derive(FromRow)]
struct JobRow {
  job_id: String,
  pipeline: Json<Pipeline>,
  state: JobState,
  results: Option<Json<Value>>,
  error: Option<String>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
  fn from(row: JobRow) -> Self {
    Self {
      job_id: row.job_id,
      pipeline: row.pipeline.0,
      state: row.state,
      results: row.results.map(|r| r.0),
      error: row.error,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(FromRow)]
struct TaskRow {
  task_id: String,
  node_name: String,
  algorithm_name: String,
  batch_index: Option<i64>,
  input: Option<Json<Vec<Value>>>,
  status: String,
  result: Option<Json<Value>>,
  error: Option<String>,
  retries: i64,
  start_time: DateTime<Utc>,
  end_time: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for NodeState {
  type Error = StoreError;

  fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
    let status: TaskStatus = serde_json::from_value(Value::String(row.status))?;
    Ok(Self {
      task_id: row.task_id,
      node_name: row.node_name,
      algorithm_name: row.algorithm_name,
      batch_index: row.batch_index.and_then(|i| usize::try_from(i).ok()),
      input: row.input.map(|i| i.0),
      status,
      result: row.result.map(|r| r.0),
      error: row.error,
      retries: u32::try_from(row.retries).unwrap_or_default(),
      start_time: row.start_time,
      end_time: row.end_time,
    })
  }
}

#[async_trait]
impl StateStore for SqliteStore {
  async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
    let row: Option<JobRow> = sqlx::query_as(
      r#"
      SELECT job_id, pipeline, state, results, error, created_at, updated_at
      FROM jobs
      WHERE job_id = ?
      "#,
    )
    .bind(job_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(JobRecord::from))
  }

  async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO jobs (job_id, pipeline, state, results, error, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (job_id) DO UPDATE SET
        pipeline = excluded.pipeline,
        state = excluded.state,
        results = excluded.results,
        error = excluded.error,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(&job.job_id)
    .bind(Json(&job.pipeline))
    .bind(job.state)
    .bind(job.results.as_ref().map(Json))
    .bind(&job.error)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn update_job_state(
    &self,
    job_id: &str,
    state: JobState,
    results: Option<&Value>,
    error: Option<&str>,
  ) -> Result<(), StoreError> {
    let updated = sqlx::query(
      r#"
      UPDATE jobs
      SET state = ?, results = COALESCE(?, results), error = COALESCE(?, error), updated_at = ?
      WHERE job_id = ?
      "#,
    )
    .bind(state)
    .bind(results.map(Json))
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return Err(StoreError::NotFound(job_id.to_string()));
    }
    Ok(())
  }

  async fn put_task(&self, job_id: &str, task: &NodeState) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO tasks (task_id, job_id, node_name, algorithm_name, batch_index, input, status, result, error, retries, start_time, end_time)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (task_id) DO UPDATE SET
        input = excluded.input,
        status = excluded.status,
        result = excluded.result,
        error = excluded.error,
        retries = excluded.retries,
        end_time = excluded.end_time
      "#,
    )
    .bind(&task.task_id)
    .bind(job_id)
    .bind(&task.node_name)
    .bind(&task.algorithm_name)
    .bind(task.batch_index.map(|i| i as i64))
    .bind(task.input.as_ref().map(Json))
    .bind(task.status.as_str())
    .bind(task.result.as_ref().map(Json))
    .bind(&task.error)
    .bind(i64::from(task.retries))
    .bind(task.start_time)
    .bind(task.end_time)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_tasks(&self, job_id: &str) -> Result<Vec<NodeState>, StoreError> {
    let rows: Vec<TaskRow> = sqlx::query_as(
      r#"
      SELECT task_id, node_name, algorithm_name, batch_index, input, status, result, error, retries, start_time, end_time
      FROM tasks
      WHERE job_id = ?
      ORDER BY rowid ASC
      "#,
    )
    .bind(job_id)
    .fetch_all(&self.pool)
    .await?;

    rows.into_iter().map(NodeState::try_from).collect()
  }

  async fn put_graph(&self, job_id: &str, graph: &Value) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO graphs (job_id, graph, updated_at)
      VALUES (?, ?, ?)
      ON CONFLICT (job_id) DO UPDATE SET
        graph = excluded.graph,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(job_id)
    .bind(Json(graph))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_graph(&self, job_id: &str) -> Result<Option<Value>, StoreError> {
    let row: Option<(Json<Value>,)> = sqlx::query_as(
      r#"
      SELECT graph
      FROM graphs
      WHERE job_id = ?
      "#,
    )
    .bind(job_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(|(graph,)| graph.0))
  }
}
