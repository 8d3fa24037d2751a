//! Progress events and sinks.
//!
//! A sink is the external collaborator that publishes progress, e.g. to a
//! REST endpoint or an event bus. The manager calls `send` at most once per
//! throttle tick and never concurrently with itself.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use braid_store::JobState;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProgressError;

/// Severity attached to a progress emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
  Trace,
  Debug,
  Info,
  Warning,
  Error,
  Critical,
}

impl fmt::Display for ProgressLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ProgressLevel::Trace => "trace",
      ProgressLevel::Debug => "debug",
      ProgressLevel::Info => "info",
      ProgressLevel::Warning => "warning",
      ProgressLevel::Error => "error",
      ProgressLevel::Critical => "critical",
    };
    f.write_str(s)
  }
}

/// One progress emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
  pub job_id: String,
  pub level: ProgressLevel,
  pub status: JobState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub progress: f64,
  pub details: String,
  pub states: BTreeMap<String, usize>,
}

/// Receives throttled progress emissions.
#[async_trait]
pub trait ProgressSink: Send + Sync {
  async fn send(&self, event: ProgressEvent) -> Result<(), ProgressError>;
}

/// A sink that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl ProgressSink for NoopSink {
  async fn send(&self, _event: ProgressEvent) -> Result<(), ProgressError> {
    Ok(())
  }
}

/// A sink that forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
  pub fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl ProgressSink for ChannelSink {
  async fn send(&self, event: ProgressEvent) -> Result<(), ProgressError> {
    self
      .sender
      .send(event)
      .map_err(|_| ProgressError::Sink("receiver dropped".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_event_wire_format() {
    let event = ProgressEvent {
      job_id: "job-1".to_string(),
      level: ProgressLevel::Warning,
      status: JobState::Active,
      error: None,
      progress: 50.0,
      details: "50% completed, 1 active, 1 completed".to_string(),
      states: BTreeMap::from([("active".to_string(), 1), ("completed".to_string(), 1)]),
    };

    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({
        "jobId": "job-1",
        "level": "warning",
        "status": "active",
        "progress": 50.0,
        "details": "50% completed, 1 active, 1 completed",
        "states": { "active": 1, "completed": 1 }
      })
    );
  }

  #[tokio::test]
  async fn test_channel_sink_forwards() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = ChannelSink::new(tx);
    let event = ProgressEvent {
      job_id: "job-1".to_string(),
      level: ProgressLevel::Info,
      status: JobState::Completed,
      error: None,
      progress: 100.0,
      details: String::new(),
      states: BTreeMap::new(),
    };

    sink.send(event.clone()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), event);

    drop(rx);
    assert!(sink.send(event).await.is_err());
  }
}
