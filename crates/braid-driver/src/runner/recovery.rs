//! Rebuilding a job from persisted task records.

use std::collections::{HashMap, HashSet};

use braid_graph::{NodeState, TaskStatus, WaitAnyWinner};
use braid_progress::ProgressLevel;
use braid_resolver::{Resolution, ResolveRequest};
use braid_store::JobState;
use serde_json::Value;
use tracing::{info, warn};

use super::{JobRunner, TaskKey};
use crate::dispatch::{ObservedTask, TaskEventKind};
use crate::error::DriverError;
use crate::outcome::JobFailure;

/// A batch element that was resolved before the restart but never created.
struct MissingElement {
  node: String,
  index: usize,
  total: usize,
  input: Vec<Value>,
}

impl JobRunner {
  /// Restore the graph from `records`, reconcile unfinished tasks with the
  /// dispatch service, then continue wherever the job left off.
  ///
  /// Tasks that already exist are never dispatched again.
  pub(super) async fn recover(&mut self, records: Vec<NodeState>) -> Result<(), DriverError> {
    let mut by_node: HashMap<String, Vec<NodeState>> = HashMap::new();
    for record in records {
      if !self.graph.contains(&record.node_name) {
        return Err(DriverError::UnknownNode {
          task_id: record.task_id,
          node: record.node_name,
        });
      }
      by_node
        .entry(record.node_name.clone())
        .or_default()
        .push(record);
    }

    let order = self.graph.topological_order().to_vec();
    let mut missing = Vec::new();
    for node in &order {
      if let Some(group) = by_node.remove(node) {
        missing.extend(self.restore_node(node, group).await?);
      }
    }
    info!(job_id = %self.job_id, tasks = self.tasks.len(), "graph_restored");

    self.reconcile().await?;

    for element in missing {
      if self.outcome.is_some() {
        return Ok(());
      }
      let template = self.graph.template(&element.node)?.clone();
      let state = self.new_task(&template, Some(element.index), element.input);
      self.graph.add_batch(element.total, state.clone())?;
      self.dispatch(state);
    }

    if self.outcome.is_none() {
      self.settle(&order).await?;
    }
    Ok(())
  }

  async fn restore_node(
    &mut self,
    node: &str,
    mut group: Vec<NodeState>,
  ) -> Result<Vec<MissingElement>, DriverError> {
    if group.iter().all(|r| r.batch_index.is_none()) {
      let mut group = group.into_iter();
      if let Some(record) = group.next() {
        for extra in group {
          warn!(job_id = %self.job_id, task_id = %extra.task_id, node = %node, "duplicate_task_record");
        }
        self.register(&record);
        self.graph.add_task(record)?;
      }
      return Ok(Vec::new());
    }

    // re-resolve to learn the batch cardinality and the inputs of elements
    // that were never persisted
    let template = self.graph.template(node)?.clone();
    let parent_results = self.graph.parents_results(node);
    let resolver = self.deps.resolver.clone();
    let resolution = resolver
      .resolve(ResolveRequest {
        node_name: node,
        flow_input: &self.flow_input,
        input: &template.input,
        parent_results: &parent_results,
        wait_any: None,
      })
      .await;

    let max_index = group.iter().filter_map(|r| r.batch_index).max().unwrap_or(0);
    let (total, inputs) = match resolution {
      Ok(Resolution::Batch(inputs)) if inputs.len() > max_index => (inputs.len(), Some(inputs)),
      _ => {
        warn!(job_id = %self.job_id, node = %node, "batch_cardinality_from_records");
        (max_index + 1, None)
      }
    };

    group.sort_by_key(|r| r.batch_index);
    let mut present = HashSet::new();
    for record in group {
      let Some(index) = record.batch_index else {
        warn!(job_id = %self.job_id, task_id = %record.task_id, node = %node, "batch_record_without_index");
        continue;
      };
      if !present.insert(index) {
        warn!(job_id = %self.job_id, task_id = %record.task_id, node = %node, "duplicate_task_record");
        continue;
      }
      self.register(&record);
      self.graph.add_batch(total, record)?;
    }

    let missing = inputs
      .map(|inputs| {
        inputs
          .into_iter()
          .enumerate()
          .filter(|(index, _)| !present.contains(index))
          .map(|(index, input)| MissingElement {
            node: node.to_string(),
            index,
            total,
            input,
          })
          .collect()
      })
      .unwrap_or_default();
    Ok(missing)
  }

  /// Ask the dispatch service about every task that was not terminal when
  /// the job went down. Finished ones are replayed, the rest are watched.
  async fn reconcile(&mut self) -> Result<(), DriverError> {
    let unfinished: Vec<(String, TaskKey, TaskStatus)> = self
      .graph
      .tasks()
      .filter(|s| !s.status.is_terminal())
      .map(|s| {
        let key = TaskKey {
          node: s.node_name.clone(),
          batch_index: s.batch_index,
        };
        (s.task_id.clone(), key, s.status)
      })
      .collect();

    for (task_id, key, persisted) in unfinished {
      if self.outcome.is_some() {
        break;
      }
      let observed = match self
        .deps
        .dispatcher
        .task_status(&self.job_id, &task_id)
        .await
      {
        Ok(observed) => observed,
        Err(e) => {
          warn!(job_id = %self.job_id, task_id = %task_id, error = %e, "task_status_unavailable");
          None
        }
      };

      match observed.and_then(ObservedTask::into_event_kind) {
        Some(TaskEventKind::Completed { result }) => {
          info!(job_id = %self.job_id, task_id = %task_id, "task_finished_while_down");
          self.complete_task(&task_id, &key, result).await?;
        }
        Some(TaskEventKind::Failed { error }) => {
          info!(job_id = %self.job_id, task_id = %task_id, "task_failed_while_down");
          self.fail_task(&task_id, &key, error).await?;
        }
        Some(TaskEventKind::Waiting) => {
          self.watch(&task_id).await;
          if persisted != TaskStatus::Pending {
            self.set_status(&task_id, &key, TaskStatus::Pending)?;
          }
        }
        Some(TaskEventKind::Active) => {
          self.watch(&task_id).await;
          if persisted != TaskStatus::Active {
            self.set_status(&task_id, &key, TaskStatus::Active)?;
          }
        }
        None => {
          self.watch(&task_id).await;
        }
      }
    }
    Ok(())
  }

  /// Evaluate the restored graph as a whole and dispatch whatever became
  /// ready while the job was down.
  async fn settle(&mut self, order: &[String]) -> Result<(), DriverError> {
    for node in order {
      if let Some(failure) = self.tolerance_failure(node) {
        self.fail(failure);
        return Ok(());
      }
      if self.graph.is_batch(node) {
        continue;
      }
      if let Some(failed) = self
        .graph
        .states(node)
        .iter()
        .find(|s| s.status == TaskStatus::Failed)
      {
        let failure = JobFailure::task(
          node,
          &failed.task_id,
          failed.error.clone().unwrap_or_default(),
        );
        self.fail(failure);
        return Ok(());
      }
    }

    if self.graph.is_all_nodes_done() {
      self.complete();
      return Ok(());
    }

    self.state = JobState::Active;
    self.writer.job_state(JobState::Active, None, None);
    self.report(ProgressLevel::Info, None);

    for node in order {
      if self.outcome.is_some() {
        break;
      }
      if self.graph.is_dispatched(node) {
        continue;
      }
      let template = self.graph.template(node)?;
      if !template.is_wait_any() {
        if self.graph.is_all_parents_finished(node) {
          self.run_node(node).await?;
        }
        continue;
      }

      if self.graph.wait_any_winner(node).is_none()
        && let Some(winner) = self.earliest_alternative(node)?
      {
        info!(job_id = %self.job_id, node = %node, winner = %winner.parent, "wait_any_fired");
        self.graph.record_wait_any_winner(node, winner)?;
      }
      if self.graph.is_wait_any_ready(node) {
        self.run_node(node).await?;
      }
    }
    Ok(())
  }

  /// The alternative of a wait-any node that succeeded first. A batch
  /// alternative counts from the moment its last element finished.
  fn earliest_alternative(&self, node: &str) -> Result<Option<WaitAnyWinner>, DriverError> {
    let template = self.graph.template(node)?;
    let winner = template
      .wait_any_alternatives()
      .into_iter()
      .filter_map(|parent| {
        let last = if self.graph.is_batch(parent) {
          self
            .graph
            .states(parent)
            .iter()
            .max_by_key(|s| s.end_time)?
        } else {
          self
            .graph
            .states(parent)
            .iter()
            .find(|s| s.status == TaskStatus::Completed)?
        };
        let outcome = self.alternative_outcome(parent, &last.task_id, last.result.clone())?;
        Some((last.end_time, outcome))
      })
      .min_by_key(|(end_time, _)| *end_time)
      .map(|(_, outcome)| outcome);
    Ok(winner)
  }
}
