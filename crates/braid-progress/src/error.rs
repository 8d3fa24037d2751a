use thiserror::Error;

/// Errors surfaced to the caller of a single progress report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgressError {
  /// The sink rejected the emission.
  #[error("progress sink failed: {0}")]
  Sink(String),

  /// The worker has shut down.
  #[error("progress worker closed")]
  Closed,
}
