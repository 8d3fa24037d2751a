use std::collections::{BTreeMap, HashMap};

use braid_config::{NodeTemplate, Pipeline};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adjacency::Adjacency;
use crate::error::GraphError;
use crate::json::{JsonEdge, JsonGraph, JsonNode};
use crate::state::{NodePatch, NodeState, TaskStatus};

/// How a node was expanded when it was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
  /// Not dispatched yet.
  Undispatched,
  Single,
  Batch { total: usize },
}

#[derive(Debug, Clone)]
struct NodeEntry {
  shape: Shape,
  states: Vec<NodeState>,
  wait_any: Option<WaitAnyWinner>,
}

impl NodeEntry {
  fn new() -> Self {
    Self {
      shape: Shape::Undispatched,
      states: Vec::new(),
      wait_any: None,
    }
  }

  /// Dispatched and every task terminal. A batch additionally needs all of
  /// its elements registered.
  fn is_finished(&self) -> bool {
    let registered = match self.shape {
      Shape::Undispatched => return false,
      Shape::Single => !self.states.is_empty(),
      Shape::Batch { total } => self.states.len() == total,
    };
    registered && self.states.iter().all(|s| s.status.is_terminal())
  }
}

/// The alternative that satisfied a wait-any gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitAnyWinner {
  pub parent: String,
  pub task_id: String,
  pub result: Value,
}

/// Element counts of a batch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
  pub total: usize,
  pub terminal: usize,
  pub completed: usize,
  pub failed: usize,
}

impl BatchSummary {
  /// Failed elements as a percentage of the batch cardinality.
  pub fn failed_percent(&self) -> f64 {
    if self.total == 0 {
      return 0.0;
    }
    self.failed as f64 / self.total as f64 * 100.0
  }

  pub fn is_done(&self) -> bool {
    self.terminal == self.total
  }
}

/// One progress unit: a task, or a node that has not been dispatched yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStat {
  pub node_name: String,
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub throughput: Option<f64>,
}

/// Final per-task result entry for job output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
  pub node_name: String,
  pub algorithm_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_index: Option<usize>,
  pub result: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// The runtime graph of a single job.
#[derive(Debug, Clone)]
pub struct NodeGraph {
  templates: Vec<NodeTemplate>,
  entries: HashMap<String, NodeEntry>,
  adjacency: Adjacency,
  order: Vec<String>,
}

impl NodeGraph {
  /// Build the graph for a pipeline.
  ///
  /// Fails on duplicate node names, references to unknown nodes and cycles.
  pub fn new(pipeline: &Pipeline) -> Result<Self, GraphError> {
    let adjacency = Adjacency::new(&pipeline.nodes)?;
    let names: Vec<String> = pipeline.nodes.iter().map(|n| n.node_name.clone()).collect();
    let order = adjacency.topological_order(&names)?;
    let entries = names
      .iter()
      .map(|name| (name.clone(), NodeEntry::new()))
      .collect();

    Ok(Self {
      templates: pipeline.nodes.clone(),
      entries,
      adjacency,
      order,
    })
  }

  /// Node templates in pipeline order.
  pub fn templates(&self) -> &[NodeTemplate] {
    &self.templates
  }

  pub fn template(&self, node_name: &str) -> Result<&NodeTemplate, GraphError> {
    self
      .templates
      .iter()
      .find(|t| t.node_name == node_name)
      .ok_or_else(|| GraphError::NodeNotFound(node_name.to_string()))
  }

  pub fn contains(&self, node_name: &str) -> bool {
    self.entries.contains_key(node_name)
  }

  /// Nodes with no incoming edges.
  pub fn find_entry_nodes(&self) -> Result<Vec<String>, GraphError> {
    let entry = self.adjacency.entry_nodes();
    if entry.is_empty() {
      return Err(GraphError::NoEntryNodes);
    }
    Ok(entry.to_vec())
  }

  pub fn children(&self, node_name: &str) -> &[String] {
    self.adjacency.children(node_name)
  }

  pub fn parents(&self, node_name: &str) -> &[String] {
    self.adjacency.parents(node_name)
  }

  /// Every node ordered so that parents come before children.
  pub fn topological_order(&self) -> &[String] {
    &self.order
  }

  fn entry(&self, node_name: &str) -> Result<&NodeEntry, GraphError> {
    self
      .entries
      .get(node_name)
      .ok_or_else(|| GraphError::NodeNotFound(node_name.to_string()))
  }

  fn entry_mut(&mut self, node_name: &str) -> Result<&mut NodeEntry, GraphError> {
    self
      .entries
      .get_mut(node_name)
      .ok_or_else(|| GraphError::NodeNotFound(node_name.to_string()))
  }

  /// Whether a node already has tasks registered.
  pub fn is_dispatched(&self, node_name: &str) -> bool {
    self
      .entries
      .get(node_name)
      .is_some_and(|e| e.shape != Shape::Undispatched)
  }

  pub fn is_batch(&self, node_name: &str) -> bool {
    self
      .entries
      .get(node_name)
      .is_some_and(|e| matches!(e.shape, Shape::Batch { .. }))
  }

  /// Register the single task of a plain (or wait-any) node.
  pub fn add_task(&mut self, state: NodeState) -> Result<(), GraphError> {
    let entry = self.entry_mut(&state.node_name)?;
    match entry.shape {
      Shape::Undispatched => {
        entry.shape = Shape::Single;
        entry.states.push(state);
        Ok(())
      }
      Shape::Single => Err(GraphError::BatchCardinality {
        node: state.node_name,
        expected: 1,
        actual: 2,
      }),
      Shape::Batch { .. } => Err(GraphError::BatchIndexRequired {
        node: state.node_name,
      }),
    }
  }

  /// Register one element of a batch node.
  ///
  /// The first call fixes the node's cardinality to `total`.
  pub fn add_batch(&mut self, total: usize, state: NodeState) -> Result<(), GraphError> {
    let node = state.node_name.clone();
    let index = state.batch_index.ok_or_else(|| GraphError::BatchIndexRequired {
      node: node.clone(),
    })?;
    let entry = self.entry_mut(&node)?;

    match entry.shape {
      Shape::Undispatched => entry.shape = Shape::Batch { total },
      Shape::Batch { total: expected } if expected != total => {
        return Err(GraphError::BatchCardinality {
          node,
          expected,
          actual: total,
        });
      }
      Shape::Batch { .. } => {}
      Shape::Single => return Err(GraphError::NotABatch { node }),
    }

    if index >= total {
      return Err(GraphError::BatchIndexOutOfRange { node, index });
    }
    if entry.states.iter().any(|s| s.batch_index == Some(index)) {
      return Err(GraphError::DuplicateBatchIndex { node, index });
    }

    let position = entry
      .states
      .iter()
      .position(|s| s.batch_index.is_some_and(|i| i > index))
      .unwrap_or(entry.states.len());
    entry.states.insert(position, state);
    Ok(())
  }

  /// Merge a patch into every task of a node.
  pub fn set_node(&mut self, node_name: &str, patch: NodePatch) -> Result<(), GraphError> {
    let entry = self.entry_mut(node_name)?;
    for state in entry.states.iter_mut() {
      state.apply(patch.clone());
    }
    Ok(())
  }

  /// Merge a patch into one task of a node.
  ///
  /// Returns `Ok(false)` if the task is already terminal and the patch would
  /// change its outcome; the state is left untouched.
  pub fn update_node_state(
    &mut self,
    node_name: &str,
    batch_index: Option<usize>,
    patch: NodePatch,
  ) -> Result<bool, GraphError> {
    let entry = self.entry_mut(node_name)?;
    let state = match (entry.shape, batch_index) {
      (Shape::Batch { .. }, None) => {
        return Err(GraphError::BatchIndexRequired {
          node: node_name.to_string(),
        });
      }
      (Shape::Batch { .. }, Some(index)) => entry
        .states
        .iter_mut()
        .find(|s| s.batch_index == Some(index))
        .ok_or_else(|| GraphError::BatchIndexOutOfRange {
          node: node_name.to_string(),
          index,
        })?,
      (_, Some(_)) => {
        return Err(GraphError::NotABatch {
          node: node_name.to_string(),
        });
      }
      (_, None) => entry
        .states
        .first_mut()
        .ok_or_else(|| GraphError::NodeNotFound(node_name.to_string()))?,
    };
    Ok(state.apply(patch))
  }

  /// All tasks of a node, batch elements in index order.
  pub fn states(&self, node_name: &str) -> &[NodeState] {
    self
      .entries
      .get(node_name)
      .map(|e| e.states.as_slice())
      .unwrap_or(&[])
  }

  pub fn state(&self, node_name: &str, batch_index: Option<usize>) -> Option<&NodeState> {
    self
      .states(node_name)
      .iter()
      .find(|s| s.batch_index == batch_index)
  }

  /// Flat list of task statuses of a node.
  pub fn get_node_states(&self, node_name: &str) -> Vec<TaskStatus> {
    self.states(node_name).iter().map(|s| s.status).collect()
  }

  /// Whether a node is dispatched and every one of its tasks is terminal.
  pub fn is_node_finished(&self, node_name: &str) -> bool {
    self.entries.get(node_name).is_some_and(NodeEntry::is_finished)
  }

  /// AND gate: every parent has reached a terminal status on every task.
  pub fn is_all_parents_finished(&self, node_name: &str) -> bool {
    self
      .parents(node_name)
      .iter()
      .all(|p| self.is_node_finished(p))
  }

  /// Element counts of a batch node; `None` for non-batch nodes.
  pub fn batch_summary(&self, node_name: &str) -> Option<BatchSummary> {
    let entry = self.entry(node_name).ok()?;
    let Shape::Batch { total } = entry.shape else {
      return None;
    };
    let mut summary = BatchSummary {
      total,
      terminal: 0,
      completed: 0,
      failed: 0,
    };
    for state in &entry.states {
      match state.status {
        TaskStatus::Completed => summary.completed += 1,
        TaskStatus::Failed => summary.failed += 1,
        _ => {}
      }
      if state.status.is_terminal() {
        summary.terminal += 1;
      }
    }
    Some(summary)
  }

  /// Aggregated result of a node: a scalar for single nodes, an array in
  /// batch index order for batch nodes (failed elements are `null`).
  pub fn node_result(&self, node_name: &str) -> Option<Value> {
    let entry = self.entry(node_name).ok()?;
    match entry.shape {
      Shape::Undispatched => None,
      Shape::Single => Some(
        entry
          .states
          .first()
          .and_then(|s| s.result.clone())
          .unwrap_or(Value::Null),
      ),
      Shape::Batch { total } => {
        let mut items = vec![Value::Null; total];
        for state in &entry.states {
          if let Some(index) = state.batch_index
            && index < total
            && state.status == TaskStatus::Completed
          {
            items[index] = state.result.clone().unwrap_or(Value::Null);
          }
        }
        Some(Value::Array(items))
      }
    }
  }

  /// Aggregated results of every dispatched parent, keyed by parent name.
  pub fn parents_results(&self, node_name: &str) -> BTreeMap<String, Value> {
    self
      .parents(node_name)
      .iter()
      .filter_map(|p| self.node_result(p).map(|r| (p.clone(), r)))
      .collect()
  }

  /// Record the first successful alternative of a wait-any node.
  ///
  /// Returns `Ok(false)` if a winner was already recorded.
  pub fn record_wait_any_winner(
    &mut self,
    node_name: &str,
    winner: WaitAnyWinner,
  ) -> Result<bool, GraphError> {
    let entry = self.entry_mut(node_name)?;
    if entry.wait_any.is_some() {
      return Ok(false);
    }
    entry.wait_any = Some(winner);
    Ok(true)
  }

  pub fn wait_any_winner(&self, node_name: &str) -> Option<&WaitAnyWinner> {
    self.entries.get(node_name).and_then(|e| e.wait_any.as_ref())
  }

  /// XOR gate: a winner is recorded and every parent that is not one of the
  /// declared alternatives has finished.
  pub fn is_wait_any_ready(&self, node_name: &str) -> bool {
    let Ok(template) = self.template(node_name) else {
      return false;
    };
    if self.wait_any_winner(node_name).is_none() {
      return false;
    }
    let alternatives = template.wait_any_alternatives();
    self
      .parents(node_name)
      .iter()
      .filter(|p| !alternatives.contains(&p.as_str()))
      .all(|p| self.is_node_finished(p))
  }

  /// Every node is dispatched and all of its tasks are terminal.
  pub fn is_all_nodes_done(&self) -> bool {
    self.entries.values().all(NodeEntry::is_finished)
  }

  /// Per-task results in pipeline order, batch elements in index order.
  pub fn all_nodes_results(&self) -> Vec<NodeResult> {
    self
      .templates
      .iter()
      .flat_map(|t| {
        self.states(&t.node_name).iter().map(|s| NodeResult {
          node_name: s.node_name.clone(),
          algorithm_name: s.algorithm_name.clone(),
          batch_index: s.batch_index,
          result: s.result.clone(),
          error: s.error.clone(),
        })
      })
      .collect()
  }

  /// Progress units: one per task plus one `creating` unit per undispatched node.
  pub fn stats(&self) -> Vec<NodeStat> {
    let mut stats = Vec::new();
    for template in &self.templates {
      let states = self.states(&template.node_name);
      if states.is_empty() {
        stats.push(NodeStat {
          node_name: template.node_name.clone(),
          status: TaskStatus::Creating,
          throughput: None,
        });
      }
      stats.extend(states.iter().map(|s| NodeStat {
        node_name: s.node_name.clone(),
        status: s.status,
        throughput: None,
      }));
    }
    stats
  }

  /// Iterate every task of every node.
  pub fn tasks(&self) -> impl Iterator<Item = &NodeState> {
    self
      .templates
      .iter()
      .flat_map(|t| self.states(&t.node_name).iter())
  }

  /// Serializable node/edge projection of the graph.
  pub fn get_json_graph(&self) -> JsonGraph {
    let nodes = self
      .templates
      .iter()
      .map(|t| JsonNode {
        node_name: t.node_name.clone(),
        algorithm_name: t.algorithm_name.clone(),
        batch: self.is_batch(&t.node_name),
        tasks: self.states(&t.node_name).to_vec(),
      })
      .collect();

    let edges = self
      .adjacency
      .edges()
      .map(|(from, to, kinds)| JsonEdge {
        from: from.to_string(),
        to: to.to_string(),
        edges: kinds.to_vec(),
      })
      .collect();

    JsonGraph { nodes, edges }
  }
}
