use std::time::Duration;

use braid_progress::{ProgressConfig, ProgressStrategy};
use serde::{Deserialize, Serialize};

/// When a batch node's failure ratio is checked against its tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
  /// Once every element of the batch is terminal.
  #[default]
  OnBatchComplete,
  /// On every element failure, against the full batch size.
  FailFast,
}

/// Driver settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
  /// Batch tolerance percentage used when a pipeline sets none.
  pub default_batch_tolerance: f64,
  pub tolerance_mode: ToleranceMode,
  pub snapshot_interval_ms: u64,
  pub progress_throttle_ms: u64,
  pub progress_backlog: usize,
  pub progress_strategy: ProgressStrategy,
}

impl Default for DriverConfig {
  fn default() -> Self {
    Self {
      default_batch_tolerance: 80.0,
      tolerance_mode: ToleranceMode::OnBatchComplete,
      snapshot_interval_ms: 4000,
      progress_throttle_ms: 1000,
      progress_backlog: 64,
      progress_strategy: ProgressStrategy::Batch,
    }
  }
}

impl DriverConfig {
  pub fn snapshot_interval(&self) -> Duration {
    Duration::from_millis(self.snapshot_interval_ms.max(1))
  }

  pub fn progress(&self) -> ProgressConfig {
    ProgressConfig {
      throttle: Duration::from_millis(self.progress_throttle_ms),
      backlog: self.progress_backlog,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_partial_config_uses_defaults() {
    let config: DriverConfig = serde_json::from_value(json!({
      "tolerance_mode": "fail_fast",
      "snapshot_interval_ms": 250
    }))
    .unwrap();

    assert_eq!(config.tolerance_mode, ToleranceMode::FailFast);
    assert_eq!(config.snapshot_interval(), Duration::from_millis(250));
    assert_eq!(config.default_batch_tolerance, 80.0);
    assert_eq!(config.progress().throttle, Duration::from_millis(1000));
  }
}
