use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("duplicate node name: {0}")]
  DuplicateNode(String),

  #[error("node '{node}' references unknown node '{reference}'")]
  UnknownReference { node: String, reference: String },

  #[error("cycle detected involving nodes: {}", nodes.join(", "))]
  CycleDetected { nodes: Vec<String> },

  #[error("unable to find entry nodes")]
  NoEntryNodes,

  #[error("node '{node}' already expanded with {expected} batch elements, got {actual}")]
  BatchCardinality {
    node: String,
    expected: usize,
    actual: usize,
  },

  #[error("node '{node}' has no batch element {index}")]
  BatchIndexOutOfRange { node: String, index: usize },

  #[error("node '{node}' batch element {index} registered twice")]
  DuplicateBatchIndex { node: String, index: usize },

  #[error("node '{node}' is a batch node; a batch index is required")]
  BatchIndexRequired { node: String },

  #[error("node '{node}' is not a batch node")]
  NotABatch { node: String },

  #[error("node '{node}' task is already terminal ({status})")]
  TerminalState { node: String, status: String },
}
