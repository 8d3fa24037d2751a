//! Braid Graph Store
//!
//! Persists a filtered projection of a job's live graph for UIs and
//! monitoring. A [`GraphSnapshotter`] is driven by its job's event loop:
//! every tick it projects the graph, skips the write when nothing changed
//! or a previous write is still in flight, and otherwise writes in the
//! background.

mod snapshot;
mod storage;
mod store;

pub use snapshot::{BatchInfo, BatchNode, GraphProjection, GraphSnapshot, SingleNode, SnapshotNode, SnapshotTask};
pub use storage::{BucketStorageResolver, NoopStorageResolver, STORAGE_MARKER, StorageResolver};
pub use store::{GraphSnapshotter, GraphStore, TickOutcome};
