//! Safety around destructive operations: the job lock, pre-import
//! snapshots and restoring from them.

pub mod lock;
pub mod restore;
pub mod snapshot;

pub use lock::{JobLock, LockRecord};
pub use snapshot::{RestoreOutcome, Snapshot, SnapshotManager};
