use serde::{Deserialize, Serialize};

use crate::input::InputExpr;

/// Whether an algorithm keeps state between inputs.
///
/// Only meaningful to the streaming variant; the batch engine ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
  Stateless,
  Stateful,
}

/// One vertex of a pipeline DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
  /// Unique within the pipeline.
  pub node_name: String,
  pub algorithm_name: String,
  #[serde(default)]
  pub input: Vec<InputExpr>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub state_type: Option<StateType>,
}

impl NodeTemplate {
  /// Names of the alternatives declared by this node's wait-any expression.
  pub fn wait_any_alternatives(&self) -> Vec<&str> {
    self
      .input
      .iter()
      .filter_map(|expr| match expr {
        InputExpr::WaitAny(alternatives) => Some(alternatives),
        _ => None,
      })
      .flatten()
      .map(|r| r.node.as_str())
      .collect()
  }

  /// Whether this node is gated by wait-any instead of waiting for all parents.
  pub fn is_wait_any(&self) -> bool {
    self
      .input
      .iter()
      .any(|expr| matches!(expr, InputExpr::WaitAny(_)))
  }
}
