pub mod snapshot;
pub mod tracker;

pub use snapshot::{ErrorSnapshotter, Snapshot, SnapshotSource};
pub use tracker::{enable_error_backtraces, ErrorGroup, ErrorRecord, ErrorTracker};
