//! Upstream snapshots.
//!
//! A snapshot is an immutable upstream tree named by a [`VersionToken`].
//! Sources pin references to tokens and export trees; the [`SnapshotStore`]
//! caches exported trees by token and verifies them on every load.

mod git;
mod lock;
mod source;
mod store;
mod types;

pub use git::GitSource;
pub use lock::{LOCK_VERSION, LockError, UpstreamLock};
pub use source::{DirSource, SnapshotSource};
pub use store::SnapshotStore;
pub use types::*;
