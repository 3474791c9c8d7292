//! Storage collaborator for Strata Live
//!
//! This crate implements the storage side of the coordination layer:
//! - Storage: the narrow trait the engine talks to
//! - VersionedStore: in-memory history of immutable snapshots, optionally
//!   persisted to a single file guarded by an exclusive lock file
//! - Snapshot / Table / RowKey: committed, immutable data
//! - WriteTransaction: private working copy committed as the next version
//! - WriteLock: blocking exclusion for writers across all handles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod file;
pub mod lock;
pub mod snapshot;
pub mod store;
pub mod write;

pub use file::{sibling, DatabaseFile};
pub use lock::WriteLock;
pub use snapshot::{Object, RowKey, Snapshot, Table};
pub use store::{Storage, VersionedStore};
pub use write::WriteTransaction;
