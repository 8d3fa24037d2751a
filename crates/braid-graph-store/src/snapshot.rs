use braid_graph::{JsonEdge, JsonGraph, NodeState, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{StorageResolver, substitute};

/// Monitoring view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTask {
  pub task_id: String,
  pub input: Option<Value>,
  pub output: Option<Value>,
  pub status: TaskStatus,
  pub error: Option<String>,
  pub retries: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_index: Option<usize>,
  pub start_time: DateTime<Utc>,
  pub end_time: Option<DateTime<Utc>>,
}

/// Element counts shown for a batch node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
  pub idle: usize,
  pub running: usize,
  pub completed: usize,
  pub errors: usize,
  pub total: usize,
}

/// A plain or wait-any node; task fields are inlined once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleNode {
  pub node_name: String,
  pub algorithm_name: String,
  #[serde(flatten)]
  pub task: Option<SnapshotTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchNode {
  pub node_name: String,
  pub algorithm_name: String,
  pub batch: Vec<SnapshotTask>,
  pub batch_info: BatchInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotNode {
  Batch(BatchNode),
  Single(SingleNode),
}

impl SnapshotNode {
  pub fn node_name(&self) -> &str {
    match self {
      SnapshotNode::Batch(n) => &n.node_name,
      SnapshotNode::Single(n) => &n.node_name,
    }
  }
}

/// The filtered graph, compared between ticks to skip redundant writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphProjection {
  pub nodes: Vec<SnapshotNode>,
  pub edges: Vec<JsonEdge>,
}

/// A persisted projection stamped with its job and write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
  pub job_id: String,
  /// Milliseconds since the Unix epoch.
  pub timestamp: i64,
  #[serde(flatten)]
  pub graph: GraphProjection,
}

impl GraphSnapshot {
  pub fn node(&self, node_name: &str) -> Option<&SnapshotNode> {
    self.graph.nodes.iter().find(|n| n.node_name() == node_name)
  }
}

impl GraphProjection {
  /// Project a live graph. Storage markers in task input are resolved on a
  /// copy; the graph itself is not touched.
  pub fn from_graph(graph: &JsonGraph, storage: &dyn StorageResolver) -> Self {
    let nodes = graph
      .nodes
      .iter()
      .map(|node| {
        let tasks: Vec<SnapshotTask> = node.tasks.iter().map(|t| map_task(t, storage)).collect();
        if node.batch {
          SnapshotNode::Batch(BatchNode {
            node_name: node.node_name.clone(),
            algorithm_name: node.algorithm_name.clone(),
            batch_info: batch_info(&tasks),
            batch: tasks,
          })
        } else {
          SnapshotNode::Single(SingleNode {
            node_name: node.node_name.clone(),
            algorithm_name: node.algorithm_name.clone(),
            task: tasks.into_iter().next(),
          })
        }
      })
      .collect();

    Self {
      nodes,
      edges: graph.edges.clone(),
    }
  }
}

fn map_task(state: &NodeState, storage: &dyn StorageResolver) -> SnapshotTask {
  let input = state.input.as_ref().map(|input| {
    let mut value = Value::Array(input.clone());
    substitute(&mut value, storage);
    value
  });
  SnapshotTask {
    task_id: state.task_id.clone(),
    input,
    output: state.result.clone(),
    status: state.status,
    error: state.error.clone(),
    retries: state.retries,
    batch_index: state.batch_index,
    start_time: state.start_time,
    end_time: state.end_time,
  }
}

fn batch_info(tasks: &[SnapshotTask]) -> BatchInfo {
  let mut info = BatchInfo {
    total: tasks.len(),
    ..Default::default()
  };
  for task in tasks {
    if task.error.is_some() {
      info.errors += 1;
    }
    match task.status {
      TaskStatus::Creating | TaskStatus::Pending => info.idle += 1,
      TaskStatus::Active => info.running += 1,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped => info.completed += 1,
    }
  }
  info
}
