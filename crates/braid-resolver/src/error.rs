use thiserror::Error;

/// Errors that can occur while resolving a node's input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
  /// A referenced parent has no result available.
  #[error("node '{node}' references '{reference}' which has no result")]
  MissingParent { node: String, reference: String },

  /// A batch source resolved to something other than an array.
  #[error("node '{node}' batch input must be an array, got {found}")]
  BatchNotArray { node: String, found: String },

  /// A batch source resolved to an empty array.
  #[error("node '{node}' batch input is empty")]
  EmptyBatch { node: String },

  /// More than one batch expression in a single node.
  #[error("node '{node}' declares more than one batch input")]
  MultipleBatch { node: String },

  /// A node mixes batch and wait-any inputs.
  #[error("node '{node}' cannot combine batch and wait-any inputs")]
  BatchWithWaitAny { node: String },

  /// The wait-any winner is not one of the node's declared alternatives.
  #[error("node '{node}' has no wait-any alternative '{parent}'")]
  UnknownAlternative { node: String, parent: String },
}
