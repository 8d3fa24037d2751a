use std::collections::HashMap;

use async_trait::async_trait;
use braid_graph::NodeState;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{JobRecord, JobState, StateStore, StoreError};

/// Store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
  jobs: RwLock<HashMap<String, JobRecord>>,
  tasks: RwLock<HashMap<String, Vec<NodeState>>>,
  graphs: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl StateStore for InMemoryStore {
  async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
    Ok(self.jobs.read().await.get(job_id).cloned())
  }

  async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
    self
      .jobs
      .write()
      .await
      .insert(job.job_id.clone(), job.clone());
    Ok(())
  }

  async fn update_job_state(
    &self,
    job_id: &str,
    state: JobState,
    results: Option<&Value>,
    error: Option<&str>,
  ) -> Result<(), StoreError> {
    let mut jobs = self.jobs.write().await;
    let job = jobs
      .get_mut(job_id)
      .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    job.state = state;
    if let Some(results) = results {
      job.results = Some(results.clone());
    }
    if let Some(error) = error {
      job.error = Some(error.to_string());
    }
    job.updated_at = Utc::now();
    Ok(())
  }

  async fn put_task(&self, job_id: &str, task: &NodeState) -> Result<(), StoreError> {
    let mut tasks = self.tasks.write().await;
    let records = tasks.entry(job_id.to_string()).or_default();
    match records.iter_mut().find(|t| t.task_id == task.task_id) {
      Some(existing) => *existing = task.clone(),
      None => records.push(task.clone()),
    }
    Ok(())
  }

  async fn list_tasks(&self, job_id: &str) -> Result<Vec<NodeState>, StoreError> {
    Ok(
      self
        .tasks
        .read()
        .await
        .get(job_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn put_graph(&self, job_id: &str, graph: &Value) -> Result<(), StoreError> {
    self
      .graphs
      .write()
      .await
      .insert(job_id.to_string(), graph.clone());
    Ok(())
  }

  async fn get_graph(&self, job_id: &str) -> Result<Option<Value>, StoreError> {
    Ok(self.graphs.read().await.get(job_id).cloned())
  }
}
