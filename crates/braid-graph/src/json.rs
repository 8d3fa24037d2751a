//! Serializable projection of a [`NodeGraph`](crate::NodeGraph).

use serde::{Deserialize, Serialize};

use crate::adjacency::EdgeKind;
use crate::state::NodeState;

/// A node with all of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonNode {
  pub node_name: String,
  pub algorithm_name: String,
  /// Whether the node was expanded as a batch.
  pub batch: bool,
  pub tasks: Vec<NodeState>,
}

/// A dependency edge, labelled with how the child consumes the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonEdge {
  pub from: String,
  pub to: String,
  pub edges: Vec<EdgeKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonGraph {
  pub nodes: Vec<JsonNode>,
  pub edges: Vec<JsonEdge>,
}
