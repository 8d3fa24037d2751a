//! Braid Config
//!
//! This crate contains the serializable pipeline definition types for braid.
//! A pipeline is an ordered list of node templates; edges between nodes are
//! implicit and come from the node input expressions that reference other
//! nodes.
//!
//! Input expressions are parsed once, when the pipeline is deserialized, into
//! the typed [`InputExpr`] tree. Nothing downstream re-parses sigil strings.
//!
//! Pipelines can be loaded from:
//! - JSON files (via the CLI)
//! - The persistence backend (as JSON blobs)

mod input;
mod node;
mod pipeline;

pub use input::{BatchSource, InputExpr, InputParseError, NodeRef};
pub use node::{NodeTemplate, StateType};
pub use pipeline::Pipeline;
