//! An in-process dispatcher with a handful of builtin algorithms.
//!
//! Tasks run on the local tokio runtime. Lifecycle events for watched tasks
//! are pushed onto a channel that the caller forwards to the driver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use braid_driver::{DispatchError, ObservedTask, TaskDispatcher, TaskEvent, TaskRequest};
use braid_graph::TaskStatus;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A task from an earlier process can never report back.
const LOST_TASK: &str = "task was lost when the previous process exited";

#[derive(Default)]
struct Registry {
  tasks: HashMap<String, ObservedTask>,
  watched: HashSet<String>,
}

pub struct LocalDispatcher {
  events: mpsc::UnboundedSender<TaskEvent>,
  registry: Arc<Mutex<Registry>>,
}

impl LocalDispatcher {
  pub fn new(events: mpsc::UnboundedSender<TaskEvent>) -> Self {
    Self {
      events,
      registry: Arc::new(Mutex::new(Registry::default())),
    }
  }
}

/// Run a builtin algorithm.
async fn execute(algorithm: &str, input: Vec<Value>) -> Result<Value, String> {
  match algorithm {
    "echo" => Ok(unwrap_single(input)),
    "sleep" => {
      let millis = input.first().and_then(Value::as_u64).unwrap_or(1000);
      tokio::time::sleep(Duration::from_millis(millis)).await;
      Ok(unwrap_single(input))
    }
    "fail" => Err(
      input
        .first()
        .and_then(Value::as_str)
        .unwrap_or("failed on request")
        .to_string(),
    ),
    other => Err(format!("unknown algorithm '{}'", other)),
  }
}

fn unwrap_single(mut input: Vec<Value>) -> Value {
  if input.len() == 1 {
    input.remove(0)
  } else {
    Value::Array(input)
  }
}

/// Record a status change and emit it if the task is watched.
fn publish(
  registry: &Mutex<Registry>,
  events: &mpsc::UnboundedSender<TaskEvent>,
  job_id: &str,
  task_id: &str,
  observed: ObservedTask,
) {
  let Ok(mut registry) = registry.lock() else {
    return;
  };
  let event = observed.clone().into_event_kind().map(|kind| TaskEvent {
    job_id: job_id.to_string(),
    task_id: task_id.to_string(),
    kind,
  });
  registry.tasks.insert(task_id.to_string(), observed);
  if let Some(event) = event
    && registry.watched.contains(task_id)
  {
    let _ = events.send(event);
  }
}

fn observation(status: TaskStatus, result: Option<Value>, error: Option<String>) -> ObservedTask {
  ObservedTask {
    status,
    result,
    error,
  }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
  async fn create_task(&self, request: TaskRequest) -> Result<(), DispatchError> {
    let TaskRequest {
      job_id,
      task_id,
      algorithm_name,
      input,
      ..
    } = request;
    publish(
      &self.registry,
      &self.events,
      &job_id,
      &task_id,
      observation(TaskStatus::Pending, None, None),
    );

    let registry = self.registry.clone();
    let events = self.events.clone();
    tokio::spawn(async move {
      publish(
        &registry,
        &events,
        &job_id,
        &task_id,
        observation(TaskStatus::Active, None, None),
      );
      let status = match execute(&algorithm_name, input).await {
        Ok(result) => observation(TaskStatus::Completed, Some(result), None),
        Err(error) => observation(TaskStatus::Failed, None, Some(error)),
      };
      debug!(task_id = %task_id, status = %status.status, "local_task_finished");
      publish(&registry, &events, &job_id, &task_id, status);
    });
    Ok(())
  }

  async fn watch_task(&self, _job_id: &str, task_id: &str) -> Result<(), DispatchError> {
    let mut registry = self
      .registry
      .lock()
      .map_err(|_| DispatchError::new("task registry poisoned"))?;
    registry.watched.insert(task_id.to_string());
    Ok(())
  }

  async fn unwatch_task(&self, _job_id: &str, task_id: &str) -> Result<(), DispatchError> {
    let mut registry = self
      .registry
      .lock()
      .map_err(|_| DispatchError::new("task registry poisoned"))?;
    registry.watched.remove(task_id);
    Ok(())
  }

  async fn task_status(
    &self,
    _job_id: &str,
    task_id: &str,
  ) -> Result<Option<ObservedTask>, DispatchError> {
    let registry = self
      .registry
      .lock()
      .map_err(|_| DispatchError::new("task registry poisoned"))?;
    let observed = registry
      .tasks
      .get(task_id)
      .cloned()
      .unwrap_or_else(|| observation(TaskStatus::Failed, None, Some(LOST_TASK.to_string())));
    Ok(Some(observed))
  }
}
