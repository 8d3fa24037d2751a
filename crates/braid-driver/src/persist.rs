//! Ordered, non-blocking persistence for one job.
//!
//! The job's event loop hands writes to a single background task so a slow
//! store never stalls event handling, while writes for the job still land
//! in the order they were issued.

use std::sync::Arc;

use braid_graph::NodeState;
use braid_store::{JobState, StateStore};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

enum StoreOp {
  Task(Box<NodeState>),
  Job {
    state: JobState,
    results: Option<Value>,
    error: Option<String>,
  },
}

pub(crate) struct StoreWriter {
  sender: mpsc::UnboundedSender<StoreOp>,
  worker: JoinHandle<()>,
}

impl StoreWriter {
  pub(crate) fn spawn(job_id: String, store: Arc<dyn StateStore>) -> Self {
    let (sender, mut receiver) = mpsc::unbounded_channel::<StoreOp>();
    let worker = tokio::spawn(async move {
      while let Some(op) = receiver.recv().await {
        let result = match op {
          StoreOp::Task(task) => store.put_task(&job_id, &task).await,
          StoreOp::Job {
            state,
            results,
            error,
          } => {
            store
              .update_job_state(&job_id, state, results.as_ref(), error.as_deref())
              .await
          }
        };
        if let Err(e) = result {
          warn!(job_id = %job_id, error = %e, "store_write_failed");
        }
      }
    });
    Self { sender, worker }
  }

  pub(crate) fn task(&self, task: &NodeState) {
    let _ = self.sender.send(StoreOp::Task(Box::new(task.clone())));
  }

  pub(crate) fn job_state(&self, state: JobState, results: Option<Value>, error: Option<String>) {
    let _ = self.sender.send(StoreOp::Job {
      state,
      results,
      error,
    });
  }

  /// Wait until every queued write has been attempted.
  pub(crate) async fn close(self) {
    drop(self.sender);
    if let Err(e) = self.worker.await {
      warn!(error = %e, "store_writer_panicked");
    }
  }
}
