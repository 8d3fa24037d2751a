//! Braid Driver
//!
//! Executes pipeline jobs. A job's graph is driven by task lifecycle events:
//! every terminal task either fails the job, completes it, or opens the gate
//! of one or more children, which are then resolved and dispatched.
//!
//! Key properties:
//! - One event loop per job. Events, dispatch acknowledgements, snapshot
//!   ticks and stop requests for a job are handled strictly one at a time.
//! - Terminal task states are final. Duplicate or late events are dropped.
//! - Batch nodes fail the job only when their failure ratio exceeds the
//!   batch tolerance; failed elements show up as `null` to children.
//! - A job whose id is already in the store is resumed from its persisted
//!   tasks. Tasks that exist are never dispatched twice.
//! - Task state and job state are persisted in order, off the event loop.

mod config;
mod dispatch;
mod driver;
mod error;
mod outcome;
mod persist;
mod runner;

pub use config::{DriverConfig, ToleranceMode};
pub use dispatch::{
  DispatchError, ObservedTask, TaskDispatcher, TaskEvent, TaskEventKind, TaskRequest,
};
pub use driver::{Driver, DriverDeps};
pub use error::DriverError;
pub use outcome::{JobFailure, JobHandle, JobOutcome, ToleranceContext};

pub use braid_store::JobState;
