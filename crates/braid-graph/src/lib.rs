//! Braid Graph
//!
//! The in-memory model of one running job: the pipeline's node templates,
//! the DAG derived from their input expressions, and the runtime state of
//! every dispatched task.
//!
//! Key properties:
//! - Adjacency is derived once at construction; `children`/`parents` are
//!   plain lookups afterwards.
//! - A node's task states are append-only. Statuses and results are updated
//!   in place and freeze once terminal.
//! - A batch node's cardinality is fixed by its first expansion.

mod adjacency;
mod error;
mod graph;
mod json;
mod state;

pub use adjacency::{Adjacency, EdgeKind};
pub use error::GraphError;
pub use graph::{BatchSummary, NodeGraph, NodeResult, NodeStat, WaitAnyWinner};
pub use json::{JsonEdge, JsonGraph, JsonNode};
pub use state::{NodePatch, NodeState, TaskStatus};
