//! The per-job event loop.
//!
//! One `JobRunner` owns one job's graph. Task events, dispatch
//! acknowledgements, snapshot ticks and the stop signal are all handled
//! here, one at a time, so the graph is never mutated concurrently.

mod recovery;

use std::collections::HashMap;

use braid_config::{NodeTemplate, Pipeline};
use braid_graph::{NodeGraph, NodePatch, NodeState, TaskStatus, WaitAnyWinner};
use braid_graph_store::GraphSnapshotter;
use braid_progress::{ProgressLevel, ProgressManager, ProgressUpdate};
use braid_resolver::{Resolution, ResolveRequest};
use braid_store::JobState;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DriverConfig, ToleranceMode};
use crate::dispatch::{DispatchError, TaskEvent, TaskEventKind, TaskRequest};
use crate::driver::DriverDeps;
use crate::error::DriverError;
use crate::outcome::{JobFailure, JobOutcome, ToleranceContext};
use crate::persist::StoreWriter;

/// How a job enters its event loop.
pub(crate) enum StartMode {
  /// No persisted state: dispatch the entry nodes.
  Fresh,
  /// Persisted state exists: rebuild from these task records.
  Recover(Vec<NodeState>),
  /// The job was persisted as stopped.
  Stopped,
}

/// Where a task lives in the graph.
#[derive(Debug, Clone)]
struct TaskKey {
  node: String,
  batch_index: Option<usize>,
}

struct DispatchAck {
  task_id: String,
  result: Result<(), DispatchError>,
}

pub(crate) struct JobRunner {
  job_id: String,
  flow_input: Value,
  tolerance: f64,
  config: DriverConfig,
  deps: DriverDeps,
  graph: NodeGraph,
  tasks: HashMap<String, TaskKey>,
  state: JobState,
  progress: ProgressManager,
  snapshotter: GraphSnapshotter,
  writer: StoreWriter,
  dispatches: JoinSet<DispatchAck>,
  outcome: Option<JobOutcome>,
}

impl JobRunner {
  pub(crate) fn new(
    job_id: String,
    pipeline: &Pipeline,
    graph: NodeGraph,
    deps: DriverDeps,
    config: DriverConfig,
    snapshotter: GraphSnapshotter,
  ) -> Self {
    let progress = ProgressManager::new(
      job_id.clone(),
      config.progress_strategy,
      deps.progress.clone(),
      config.progress(),
    );
    let writer = StoreWriter::spawn(job_id.clone(), deps.store.clone());

    Self {
      tolerance: pipeline
        .batch_tolerance
        .unwrap_or(config.default_batch_tolerance),
      flow_input: pipeline.flow_input(),
      job_id,
      config,
      deps,
      graph,
      tasks: HashMap::new(),
      state: JobState::Active,
      progress,
      snapshotter,
      writer,
      dispatches: JoinSet::new(),
      outcome: None,
    }
  }

  /// Drive the job until it completes, fails or is stopped.
  #[instrument(name = "job_run", skip_all, fields(job_id = %self.job_id))]
  pub(crate) async fn run(
    mut self,
    mode: StartMode,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    cancel: CancellationToken,
  ) -> JobOutcome {
    match mode {
      StartMode::Stopped => {
        info!(job_id = %self.job_id, "job_already_stopped");
        self.finish_stopped();
      }
      StartMode::Fresh => {
        info!(job_id = %self.job_id, nodes = self.graph.templates().len(), "job_started");
        self.report(ProgressLevel::Info, None);
        self.snapshotter.start(&self.graph).await;
        if let Err(e) = self.start_nodes().await {
          self.fail_internal(e);
        }
      }
      StartMode::Recover(records) => {
        self.state = JobState::Recovering;
        info!(job_id = %self.job_id, tasks = records.len(), "job_recovering");
        self.report(ProgressLevel::Info, None);
        if let Err(e) = self.recover(records).await {
          self.fail_internal(e);
        }
        self.snapshotter.start(&self.graph).await;
      }
    }

    let period = self.config.snapshot_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while self.outcome.is_none() {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          self.finish_stopped();
        }
        Some(ack) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
          if let Err(e) = self.on_dispatch_ack(ack).await {
            self.fail_internal(e);
          }
        }
        event = events.recv() => match event {
          Some(event) => {
            if let Err(e) = self.on_task_event(event).await {
              self.fail_internal(e);
            }
          }
          None => self.finish_stopped(),
        },
        _ = ticker.tick() => {
          self.snapshotter.tick(&self.graph);
        }
      }
    }

    self.shutdown().await
  }

  async fn shutdown(mut self) -> JobOutcome {
    self.dispatches.abort_all();

    let outstanding: Vec<String> = self
      .graph
      .tasks()
      .filter(|s| !s.status.is_terminal())
      .map(|s| s.task_id.clone())
      .collect();
    for task_id in &outstanding {
      self.unwatch(task_id).await;
    }

    self.snapshotter.stop(&self.graph).await;
    let outcome = self
      .outcome
      .take()
      .unwrap_or_else(|| JobOutcome::stopped(&self.job_id));

    self.progress.close().await;
    self.writer.close().await;
    outcome
  }

  async fn start_nodes(&mut self) -> Result<(), DriverError> {
    for node in self.graph.find_entry_nodes()? {
      if self.outcome.is_some() {
        break;
      }
      self.run_node(&node).await?;
    }
    Ok(())
  }

  /// Resolve a node's input and dispatch its task(s).
  ///
  /// A node that already has tasks is left alone.
  #[instrument(name = "run_node", skip(self), fields(job_id = %self.job_id))]
  async fn run_node(&mut self, node: &str) -> Result<(), DriverError> {
    if self.outcome.is_some() || self.graph.is_dispatched(node) {
      return Ok(());
    }

    let template = self.graph.template(node)?.clone();
    let parent_results = self.graph.parents_results(node);
    let winner = self.graph.wait_any_winner(node).cloned();
    let resolver = self.deps.resolver.clone();
    let resolution = resolver
      .resolve(ResolveRequest {
        node_name: node,
        flow_input: &self.flow_input,
        input: &template.input,
        parent_results: &parent_results,
        wait_any: winner.as_ref().map(|w| (w.parent.as_str(), &w.result)),
      })
      .await;

    let resolution = match resolution {
      Ok(resolution) => resolution,
      Err(e) => {
        error!(job_id = %self.job_id, node = %node, error = %e, "input_resolution_failed");
        self.fail(JobFailure::node(node, e.to_string()));
        return Ok(());
      }
    };

    match resolution {
      Resolution::WaitAny => {
        debug!(job_id = %self.job_id, node = %node, "wait_any_deferred");
      }
      Resolution::Single(input) => {
        let state = self.new_task(&template, None, input);
        self.graph.add_task(state.clone())?;
        self.dispatch(state);
      }
      Resolution::Batch(inputs) => {
        let total = inputs.len();
        for (index, input) in inputs.into_iter().enumerate() {
          let state = self.new_task(&template, Some(index), input);
          self.graph.add_batch(total, state.clone())?;
          self.dispatch(state);
        }
        info!(job_id = %self.job_id, node = %node, total, "batch_dispatched");
      }
    }
    self.report(ProgressLevel::Info, None);
    Ok(())
  }

  fn new_task(
    &self,
    template: &NodeTemplate,
    batch_index: Option<usize>,
    input: Vec<Value>,
  ) -> NodeState {
    let task_id = format!("{}:{}", template.algorithm_name, Uuid::new_v4());
    NodeState::new(
      task_id,
      &template.node_name,
      &template.algorithm_name,
      batch_index,
    )
    .with_input(input)
  }

  fn register(&mut self, state: &NodeState) {
    self.tasks.insert(
      state.task_id.clone(),
      TaskKey {
        node: state.node_name.clone(),
        batch_index: state.batch_index,
      },
    );
  }

  /// Watch and create a task in the background.
  fn dispatch(&mut self, state: NodeState) {
    self.register(&state);
    self.writer.task(&state);

    match state.batch_index {
      Some(index) => info!(
        job_id = %self.job_id,
        task_id = %state.task_id,
        batch_id = %format!("{}#{}", state.node_name, index + 1),
        "task_dispatching"
      ),
      None => info!(
        job_id = %self.job_id,
        task_id = %state.task_id,
        node = %state.node_name,
        "task_dispatching"
      ),
    }

    let request = TaskRequest {
      job_id: self.job_id.clone(),
      task_id: state.task_id,
      node_name: state.node_name,
      algorithm_name: state.algorithm_name,
      batch_index: state.batch_index,
      input: state.input.unwrap_or_default(),
    };
    let dispatcher = self.deps.dispatcher.clone();
    self.dispatches.spawn(async move {
      let task_id = request.task_id.clone();
      if let Err(e) = dispatcher.watch_task(&request.job_id, &task_id).await {
        warn!(job_id = %request.job_id, task_id = %task_id, error = %e, "task_watch_failed");
      }
      let result = dispatcher.create_task(request).await;
      DispatchAck { task_id, result }
    });
  }

  async fn on_dispatch_ack(
    &mut self,
    ack: Result<DispatchAck, JoinError>,
  ) -> Result<(), DriverError> {
    match ack {
      Ok(DispatchAck {
        task_id,
        result: Ok(()),
      }) => {
        debug!(job_id = %self.job_id, task_id = %task_id, "task_created");
        Ok(())
      }
      Ok(DispatchAck {
        task_id,
        result: Err(e),
      }) => {
        error!(job_id = %self.job_id, task_id = %task_id, error = %e, "task_create_failed");
        let event = TaskEvent::failed(self.job_id.clone(), task_id, e.to_string());
        self.on_task_event(event).await
      }
      Err(e) => {
        error!(job_id = %self.job_id, error = %e, "task_dispatch_aborted");
        Ok(())
      }
    }
  }

  async fn on_task_event(&mut self, event: TaskEvent) -> Result<(), DriverError> {
    let Some(key) = self.tasks.get(&event.task_id).cloned() else {
      error!(job_id = %self.job_id, task_id = %event.task_id, "unknown_task");
      return Ok(());
    };
    if !self.graph.contains(&key.node) {
      return Err(DriverError::UnknownNode {
        task_id: event.task_id,
        node: key.node,
      });
    }

    match event.kind {
      TaskEventKind::Waiting => self.set_status(&event.task_id, &key, TaskStatus::Pending),
      TaskEventKind::Active => self.set_status(&event.task_id, &key, TaskStatus::Active),
      TaskEventKind::Completed { result } => {
        self.complete_task(&event.task_id, &key, result).await
      }
      TaskEventKind::Failed { error } => self.fail_task(&event.task_id, &key, error).await,
    }
  }

  fn set_status(
    &mut self,
    task_id: &str,
    key: &TaskKey,
    status: TaskStatus,
  ) -> Result<(), DriverError> {
    if !self
      .graph
      .update_node_state(&key.node, key.batch_index, NodePatch::status(status))?
    {
      debug!(job_id = %self.job_id, task_id = %task_id, status = %status, "late_status_ignored");
      return Ok(());
    }
    info!(job_id = %self.job_id, task_id = %task_id, status = %status, "task_status_changed");
    self.persist_task(key);
    self.report(ProgressLevel::Info, None);
    Ok(())
  }

  async fn complete_task(
    &mut self,
    task_id: &str,
    key: &TaskKey,
    result: Value,
  ) -> Result<(), DriverError> {
    let patch = NodePatch::completed(result.clone());
    if !self
      .graph
      .update_node_state(&key.node, key.batch_index, patch)?
    {
      debug!(job_id = %self.job_id, task_id = %task_id, "duplicate_terminal_event");
      return Ok(());
    }
    info!(job_id = %self.job_id, task_id = %task_id, node = %key.node, "task_completed");
    self.unwatch(task_id).await;
    self.persist_task(key);
    self.report(ProgressLevel::Info, None);
    self.after_task(task_id, key, Some(result)).await
  }

  async fn fail_task(
    &mut self,
    task_id: &str,
    key: &TaskKey,
    error: String,
  ) -> Result<(), DriverError> {
    let patch = NodePatch::failed(error.clone());
    if !self
      .graph
      .update_node_state(&key.node, key.batch_index, patch)?
    {
      debug!(job_id = %self.job_id, task_id = %task_id, "duplicate_terminal_event");
      return Ok(());
    }
    error!(job_id = %self.job_id, task_id = %task_id, node = %key.node, error = %error, "task_failed");
    self.unwatch(task_id).await;
    self.persist_task(key);

    if !self.graph.is_batch(&key.node) {
      self.fail(JobFailure::task(&key.node, task_id, error));
      return Ok(());
    }
    self.report(ProgressLevel::Warning, None);
    self.after_task(task_id, key, None).await
  }

  /// Follow-up of a terminal task: tolerance, job completion, then children.
  async fn after_task(
    &mut self,
    task_id: &str,
    key: &TaskKey,
    result: Option<Value>,
  ) -> Result<(), DriverError> {
    if let Some(failure) = self.tolerance_failure(&key.node) {
      self.fail(failure);
      return Ok(());
    }
    if self.graph.is_all_nodes_done() {
      self.complete();
      return Ok(());
    }
    let winner = self.alternative_outcome(&key.node, task_id, result);
    self.run_children(&key.node, winner).await
  }

  /// What `node` offers a wait-any child once it has succeeded: the task's
  /// own result for single nodes, the ordered batch result once every
  /// element of a batch is terminal.
  fn alternative_outcome(
    &self,
    node: &str,
    task_id: &str,
    result: Option<Value>,
  ) -> Option<WaitAnyWinner> {
    if self.graph.is_batch(node) {
      if !self.graph.is_node_finished(node) {
        return None;
      }
      return Some(WaitAnyWinner {
        parent: node.to_string(),
        task_id: task_id.to_string(),
        result: self.graph.node_result(node)?,
      });
    }
    result.map(|result| WaitAnyWinner {
      parent: node.to_string(),
      task_id: task_id.to_string(),
      result,
    })
  }

  /// Check a batch node's failure ratio against the job's tolerance.
  fn tolerance_failure(&self, node: &str) -> Option<JobFailure> {
    let summary = self.graph.batch_summary(node)?;
    let due = match self.config.tolerance_mode {
      ToleranceMode::FailFast => true,
      ToleranceMode::OnBatchComplete => summary.is_done(),
    };
    let percent = summary.failed_percent();
    if !due || summary.failed == 0 || percent <= self.tolerance {
      return None;
    }

    let origin = self
      .graph
      .states(node)
      .iter()
      .filter(|s| s.status == TaskStatus::Failed)
      .max_by_key(|s| s.end_time)?;

    error!(
      job_id = %self.job_id,
      node = %node,
      failed = summary.failed,
      total = summary.total,
      percent,
      tolerance = self.tolerance,
      "batch_tolerance_exceeded"
    );
    Some(JobFailure {
      node: Some(node.to_string()),
      task_id: Some(origin.task_id.clone()),
      error: origin.error.clone().unwrap_or_default(),
      tolerance: Some(ToleranceContext {
        failed: summary.failed,
        total: summary.total,
        percent,
        tolerance: self.tolerance,
      }),
    })
  }

  /// Dispatch the children of `node` whose gate is now open.
  ///
  /// `winner` is set once `node` has succeeded as a whole, which may fire
  /// the wait-any gate of a child that lists `node` as an alternative.
  async fn run_children(
    &mut self,
    node: &str,
    winner: Option<WaitAnyWinner>,
  ) -> Result<(), DriverError> {
    let children = self.graph.children(node).to_vec();
    for child in children {
      if self.outcome.is_some() {
        break;
      }
      if self.graph.is_dispatched(&child) {
        continue;
      }

      let template = self.graph.template(&child)?;
      let wait_any = template.is_wait_any();
      let alternative = template.wait_any_alternatives().contains(&node);

      if !wait_any {
        if self.graph.is_all_parents_finished(&child) {
          self.run_node(&child).await?;
        }
        continue;
      }

      if alternative
        && let Some(winner) = &winner
        && self.graph.record_wait_any_winner(&child, winner.clone())?
      {
        info!(job_id = %self.job_id, node = %child, winner = %node, "wait_any_fired");
      }
      if self.graph.is_wait_any_ready(&child) {
        self.run_node(&child).await?;
      }
    }
    Ok(())
  }

  fn complete(&mut self) {
    if self.outcome.is_some() {
      return;
    }
    let results = self.graph.all_nodes_results();
    let value = match serde_json::to_value(&results) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(job_id = %self.job_id, error = %e, "job_results_unserializable");
        None
      }
    };

    self.state = JobState::Completed;
    info!(job_id = %self.job_id, tasks = results.len(), "job_completed");
    self.writer.job_state(JobState::Completed, value, None);
    self.report(ProgressLevel::Info, None);
    self.outcome = Some(JobOutcome::completed(&self.job_id, results));
  }

  fn fail(&mut self, failure: JobFailure) {
    if self.outcome.is_some() {
      return;
    }
    let message = failure.to_string();
    self.state = JobState::Failed;
    error!(job_id = %self.job_id, error = %message, "job_failed");
    self
      .writer
      .job_state(JobState::Failed, None, Some(message.clone()));
    self.report(ProgressLevel::Error, Some(message));
    self.outcome = Some(JobOutcome::failed(&self.job_id, failure));
  }

  fn fail_internal(&mut self, error: DriverError) {
    self.fail(JobFailure::internal(error.to_string()));
  }

  fn finish_stopped(&mut self) {
    if self.outcome.is_some() {
      return;
    }
    self.state = JobState::Stopped;
    info!(job_id = %self.job_id, "job_stopped");
    self.writer.job_state(JobState::Stopped, None, None);
    self.report(ProgressLevel::Info, None);
    self.outcome = Some(JobOutcome::stopped(&self.job_id));
  }

  fn persist_task(&self, key: &TaskKey) {
    if let Some(state) = self.graph.state(&key.node, key.batch_index) {
      self.writer.task(state);
    }
  }

  fn report(&mut self, level: ProgressLevel, error: Option<String>) {
    let stats = self.graph.stats();
    let update = match error {
      Some(error) => ProgressUpdate::failed(error),
      None => ProgressUpdate::status(self.state),
    };
    // the worker logs failed sends
    let _ticket = self.progress.report(level, &stats, update);
  }

  async fn watch(&self, task_id: &str) {
    if let Err(e) = self.deps.dispatcher.watch_task(&self.job_id, task_id).await {
      warn!(job_id = %self.job_id, task_id = %task_id, error = %e, "task_watch_failed");
    }
  }

  async fn unwatch(&self, task_id: &str) {
    if let Err(e) = self.deps.dispatcher.unwatch_task(&self.job_id, task_id).await {
      warn!(job_id = %self.job_id, task_id = %task_id, error = %e, "task_unwatch_failed");
    }
  }
}
