use std::collections::HashMap;
use std::sync::Arc;

use braid_config::Pipeline;
use braid_graph::NodeGraph;
use braid_graph_store::{GraphSnapshot, GraphStore, NoopStorageResolver, StorageResolver};
use braid_progress::{NoopSink, ProgressSink};
use braid_resolver::{InputResolver, StandardResolver};
use braid_store::{JobRecord, JobState, StateStore};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::dispatch::{TaskDispatcher, TaskEvent};
use crate::error::DriverError;
use crate::outcome::JobHandle;
use crate::runner::{JobRunner, StartMode};

/// The collaborators a driver works with.
#[derive(Clone)]
pub struct DriverDeps {
  pub store: Arc<dyn StateStore>,
  pub dispatcher: Arc<dyn TaskDispatcher>,
  pub resolver: Arc<dyn InputResolver>,
  pub progress: Arc<dyn ProgressSink>,
  pub storage: Arc<dyn StorageResolver>,
}

impl DriverDeps {
  /// Standard input resolution, no progress reporting, no storage references.
  pub fn new(store: Arc<dyn StateStore>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
    Self {
      store,
      dispatcher,
      resolver: Arc::new(StandardResolver::new()),
      progress: Arc::new(NoopSink),
      storage: Arc::new(NoopStorageResolver),
    }
  }

  pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
    self.resolver = resolver;
    self
  }

  pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
    self.progress = progress;
    self
  }

  pub fn with_storage(mut self, storage: Arc<dyn StorageResolver>) -> Self {
    self.storage = storage;
    self
  }
}

struct JobEntry {
  events: mpsc::UnboundedSender<TaskEvent>,
  cancel: CancellationToken,
}

/// Runs pipeline jobs.
///
/// Each started job gets its own event loop. The driver routes task events
/// and stop requests to it and forgets the job once it reaches a final state.
pub struct Driver {
  deps: DriverDeps,
  config: DriverConfig,
  graph_store: GraphStore,
  jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
  cancel: CancellationToken,
}

impl Driver {
  pub fn new(deps: DriverDeps, config: DriverConfig) -> Self {
    let graph_store = GraphStore::new(deps.store.clone(), deps.storage.clone());
    Self {
      deps,
      config,
      graph_store,
      jobs: Arc::new(Mutex::new(HashMap::new())),
      cancel: CancellationToken::new(),
    }
  }

  /// Start a job, or resume it if the store already knows it.
  ///
  /// A job persisted as stopped is not resumed; its handle resolves to
  /// `Stopped` right away.
  #[instrument(name = "job_start", skip(self, pipeline), fields(pipeline = %pipeline.name))]
  pub async fn start(&self, job_id: &str, pipeline: Pipeline) -> Result<JobHandle, DriverError> {
    let graph = NodeGraph::new(&pipeline)?;
    graph.find_entry_nodes()?;
    let tolerance = pipeline
      .batch_tolerance
      .unwrap_or(self.config.default_batch_tolerance);
    if !(0.0..=100.0).contains(&tolerance) {
      return Err(DriverError::InvalidTolerance { tolerance });
    }

    // Reserve the id before touching the store so a concurrent start of the
    // same job never reaches it.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = self.cancel.child_token();
    {
      let mut jobs = self.jobs.lock().await;
      if jobs.contains_key(job_id) {
        return Err(DriverError::JobAlreadyRunning {
          job_id: job_id.to_string(),
        });
      }
      jobs.insert(
        job_id.to_string(),
        JobEntry {
          events: events_tx,
          cancel: cancel.clone(),
        },
      );
    }

    let mode = match self.probe(job_id, &pipeline).await {
      Ok(mode) => mode,
      Err(e) => {
        self.jobs.lock().await.remove(job_id);
        return Err(e);
      }
    };

    let runner = JobRunner::new(
      job_id.to_string(),
      &pipeline,
      graph,
      self.deps.clone(),
      self.config.clone(),
      self.graph_store.snapshotter(job_id),
    );
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let jobs = self.jobs.clone();
    let key = job_id.to_string();
    tokio::spawn(async move {
      let outcome = runner.run(mode, events_rx, cancel).await;
      jobs.lock().await.remove(&key);
      debug!(job_id = %key, state = %outcome.state, "job_released");
      let _ = outcome_tx.send(outcome);
    });

    Ok(JobHandle::new(job_id.to_string(), outcome_rx))
  }

  /// Decide how a job starts from what the store knows about it.
  async fn probe(&self, job_id: &str, pipeline: &Pipeline) -> Result<StartMode, DriverError> {
    let mode = match self.deps.store.get_job(job_id).await? {
      None => {
        self
          .deps
          .store
          .put_job(&JobRecord::new(job_id, pipeline.clone()))
          .await?;
        StartMode::Fresh
      }
      Some(record) if record.state == JobState::Stopped => StartMode::Stopped,
      Some(record) => {
        let tasks = self.deps.store.list_tasks(job_id).await?;
        info!(job_id = %job_id, previous = %record.state, tasks = tasks.len(), "job_found_in_store");
        self
          .deps
          .store
          .update_job_state(job_id, JobState::Recovering, None, None)
          .await?;
        StartMode::Recover(tasks)
      }
    };
    Ok(mode)
  }

  /// Request a running job to stop.
  ///
  /// Returns `false` if the job is not running here. Repeated calls are
  /// harmless.
  pub async fn stop(&self, job_id: &str) -> bool {
    match self.jobs.lock().await.get(job_id) {
      Some(entry) => {
        info!(job_id = %job_id, "job_stop_requested");
        entry.cancel.cancel();
        true
      }
      None => {
        debug!(job_id = %job_id, "job_not_running");
        false
      }
    }
  }

  /// Route a task lifecycle event to its job.
  ///
  /// Returns `false` if the job is not running here.
  pub async fn task_event(&self, event: TaskEvent) -> bool {
    let jobs = self.jobs.lock().await;
    let Some(entry) = jobs.get(&event.job_id) else {
      warn!(job_id = %event.job_id, task_id = %event.task_id, "event_for_unknown_job");
      return false;
    };
    entry.events.send(event).is_ok()
  }

  /// The last persisted graph snapshot of a job.
  pub async fn get_graph(&self, job_id: &str) -> Result<Option<GraphSnapshot>, DriverError> {
    Ok(self.graph_store.get_graph(job_id).await?)
  }

  pub async fn is_running(&self, job_id: &str) -> bool {
    self.jobs.lock().await.contains_key(job_id)
  }

  /// Stop every running job.
  pub fn shutdown(&self) {
    info!("driver_shutdown");
    self.cancel.cancel();
  }
}
