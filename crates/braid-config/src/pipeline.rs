use serde::{Deserialize, Serialize};

use crate::node::NodeTemplate;

/// A pipeline definition as submitted for execution.
///
/// Loaded once per job and never mutated while the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
  pub name: String,
  pub nodes: Vec<NodeTemplate>,
  /// Input value available to every node through `@flowInput` references.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub flow_input: Option<serde_json::Value>,
  /// Percentage (0-100) of a batch node's elements allowed to fail.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub batch_tolerance: Option<f64>,
  /// Trigger metadata. Opaque to the engine.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub triggers: Option<serde_json::Value>,
}

impl Pipeline {
  /// The flow input, or `null` when the pipeline has none.
  pub fn flow_input(&self) -> serde_json::Value {
    self.flow_input.clone().unwrap_or(serde_json::Value::Null)
  }
}
