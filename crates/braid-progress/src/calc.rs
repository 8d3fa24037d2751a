use std::collections::BTreeMap;

use braid_graph::NodeStat;
use serde::{Deserialize, Serialize};

/// How progress is derived from graph statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStrategy {
  /// Share of units in a terminal status.
  #[default]
  Batch,
  /// Median throughput of all units.
  Stream,
}

/// Result of one progress calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressCalc {
  pub progress: f64,
  pub details: String,
  pub states: BTreeMap<String, usize>,
}

impl ProgressStrategy {
  pub fn calculate(self, stats: &[NodeStat]) -> ProgressCalc {
    if stats.is_empty() {
      return ProgressCalc::default();
    }
    let states = count_states(stats);
    match self {
      ProgressStrategy::Batch => {
        let terminal = stats.iter().filter(|s| s.status.is_terminal()).count();
        let progress = round2(terminal as f64 / stats.len() as f64 * 100.0);
        ProgressCalc {
          progress,
          details: format!("{}% completed, {}", progress, describe(&states)),
          states,
        }
      }
      ProgressStrategy::Stream => {
        let throughput: Vec<f64> = stats.iter().map(|s| s.throughput.unwrap_or(0.0)).collect();
        let progress = round2(median(throughput) * 100.0);
        ProgressCalc {
          progress,
          details: format!("{}% median throughput, {}", progress, describe(&states)),
          states,
        }
      }
    }
  }
}

fn count_states(stats: &[NodeStat]) -> BTreeMap<String, usize> {
  let mut states = BTreeMap::new();
  for stat in stats {
    *states.entry(stat.status.as_str().to_string()).or_insert(0) += 1;
  }
  states
}

fn describe(states: &BTreeMap<String, usize>) -> String {
  states
    .iter()
    .map(|(status, count)| format!("{} {}", count, status))
    .collect::<Vec<_>>()
    .join(", ")
}

fn median(mut values: Vec<f64>) -> f64 {
  if values.is_empty() {
    return 0.0;
  }
  values.sort_by(f64::total_cmp);
  let half = values.len() / 2;
  if values.len() % 2 == 1 {
    values[half]
  } else {
    (values[half - 1] + values[half]) / 2.0
  }
}

fn round2(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}
