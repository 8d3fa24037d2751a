//! Braid Progress
//!
//! Computes a job's 0-100 progress figure from its graph statistics and
//! pushes it to a [`ProgressSink`].
//!
//! Emission goes through a single worker task:
//! - at most one emission per throttle interval, leading and trailing edge
//! - emissions never overlap and are never reordered
//! - each report gets a [`ProgressTicket`] that resolves with the outcome of
//!   that report only, so a failing send surfaces to its own caller

mod calc;
mod error;
mod manager;
mod sink;

pub use calc::{ProgressCalc, ProgressStrategy};
pub use error::ProgressError;
pub use manager::{ProgressConfig, ProgressManager, ProgressOutcome, ProgressTicket, ProgressUpdate};
pub use sink::{ChannelSink, NoopSink, ProgressEvent, ProgressLevel, ProgressSink};
