use std::sync::Arc;

use braid_graph::NodeGraph;
use braid_store::{StateStore, StoreError};
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::snapshot::{GraphProjection, GraphSnapshot};
use crate::storage::StorageResolver;

/// Reads snapshots and hands out per-job snapshotters.
#[derive(Clone)]
pub struct GraphStore {
  backend: Arc<dyn StateStore>,
  storage: Arc<dyn StorageResolver>,
}

impl GraphStore {
  pub fn new(backend: Arc<dyn StateStore>, storage: Arc<dyn StorageResolver>) -> Self {
    Self { backend, storage }
  }

  /// The last persisted snapshot of a job.
  pub async fn get_graph(&self, job_id: &str) -> Result<Option<GraphSnapshot>, StoreError> {
    match self.backend.get_graph(job_id).await? {
      Some(value) => Ok(Some(serde_json::from_value(value)?)),
      None => Ok(None),
    }
  }

  pub fn snapshotter(&self, job_id: impl Into<String>) -> GraphSnapshotter {
    GraphSnapshotter {
      job_id: job_id.into(),
      backend: self.backend.clone(),
      storage: self.storage.clone(),
      last: None,
      in_flight: None,
    }
  }
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
  /// A previous write is still running.
  Busy,
  /// The projection equals the last written one.
  Unchanged,
  /// A write was started.
  Written,
}

/// Snapshots one job's graph. Owned by the job's event loop.
pub struct GraphSnapshotter {
  job_id: String,
  backend: Arc<dyn StateStore>,
  storage: Arc<dyn StorageResolver>,
  last: Option<GraphProjection>,
  in_flight: Option<JoinHandle<Result<(), StoreError>>>,
}

impl GraphSnapshotter {
  /// Take the initial snapshot and wait for it to be written.
  pub async fn start(&mut self, graph: &NodeGraph) {
    if self.tick(graph) == TickOutcome::Written {
      self.flush().await;
    }
  }

  /// Project the graph and start a write if it changed.
  ///
  /// Never blocks: the write runs on a spawned task, and a tick that finds
  /// it still running is skipped.
  pub fn tick(&mut self, graph: &NodeGraph) -> TickOutcome {
    if let Some(handle) = self.in_flight.take() {
      if !handle.is_finished() {
        self.in_flight = Some(handle);
        return TickOutcome::Busy;
      }
      if let Some(result) = handle.now_or_never() {
        self.observe(result);
      }
    }

    let projection = GraphProjection::from_graph(&graph.get_json_graph(), self.storage.as_ref());
    if self.last.as_ref() == Some(&projection) {
      return TickOutcome::Unchanged;
    }

    let snapshot = GraphSnapshot {
      job_id: self.job_id.clone(),
      timestamp: Utc::now().timestamp_millis(),
      graph: projection.clone(),
    };
    self.last = Some(projection);

    let backend = self.backend.clone();
    self.in_flight = Some(tokio::spawn(async move {
      let value = serde_json::to_value(&snapshot)?;
      backend.put_graph(&snapshot.job_id, &value).await
    }));
    TickOutcome::Written
  }

  /// Wait for the in-flight write, if any.
  pub async fn flush(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      self.observe(handle.await);
    }
  }

  /// Wait for the in-flight write, then take a final snapshot.
  pub async fn stop(&mut self, graph: &NodeGraph) {
    self.flush().await;
    if self.tick(graph) == TickOutcome::Written {
      self.flush().await;
    }
  }

  fn observe(&mut self, result: Result<Result<(), StoreError>, tokio::task::JoinError>) {
    let error = match result {
      Ok(Ok(())) => {
        debug!(job_id = %self.job_id, "graph_snapshot_written");
        return;
      }
      Ok(Err(e)) => e.to_string(),
      Err(e) => e.to_string(),
    };
    error!(job_id = %self.job_id, error = %error, "graph_snapshot_failed");
    // forget what was written so the next tick retries
    self.last = None;
  }
}
