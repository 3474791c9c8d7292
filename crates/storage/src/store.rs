//! Storage collaborator
//!
//! The coordination layer only reaches storage through the [`Storage`] trait:
//! open a snapshot, commit a write, diff a query between two snapshots, read
//! the schema of a snapshot. [`VersionedStore`] is the reference
//! implementation: an in-memory history of committed snapshots, optionally
//! persisted to a single file.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strata_core::{ChangeSet, Query, Schema, StrataError, StrataResult, VersionClock};
use tracing::{debug, info};

use crate::file::DatabaseFile;
use crate::lock::WriteLock;
use crate::snapshot::Snapshot;
use crate::write::WriteTransaction;

/// Narrow interface between the coordination layer and storage
pub trait Storage: Send + Sync {
    /// Version of the newest committed snapshot
    fn latest_version(&self) -> VersionClock;

    /// Open the snapshot committed at `transaction_sequence`
    fn open_snapshot(&self, transaction_sequence: u64) -> StrataResult<Arc<Snapshot>>;

    /// Open the newest committed snapshot
    fn latest_snapshot(&self) -> StrataResult<Arc<Snapshot>> {
        self.open_snapshot(self.latest_version().transaction_sequence)
    }

    /// Start a working copy of the newest snapshot
    ///
    /// The caller must hold the [`write_lock`](Self::write_lock).
    fn begin_write(&self) -> StrataResult<WriteTransaction> {
        let snapshot = self.latest_snapshot()?;
        Ok(WriteTransaction::new(&snapshot))
    }

    /// Publish a write transaction as the next version
    fn commit(&self, txn: WriteTransaction) -> StrataResult<VersionClock>;

    /// Changes to a query's results between two snapshots
    fn diff(&self, query: &Query, old: &Snapshot, new: &Snapshot) -> ChangeSet {
        ChangeSet::diff(&old.evaluate(query), &new.evaluate(query))
    }

    /// Schema stored in a snapshot
    fn read_schema(&self, snapshot: &Snapshot) -> Schema {
        snapshot.schema().clone()
    }

    /// Lock serializing writers across every handle on the file
    fn write_lock(&self) -> &WriteLock;

    /// Forget snapshots older than `transaction_sequence`
    ///
    /// The newest snapshot is always kept. Returns the number released.
    fn gc_versions_before(&self, transaction_sequence: u64) -> usize;
}

/// Multi-version snapshot store
pub struct VersionedStore {
    history: RwLock<BTreeMap<u64, Arc<Snapshot>>>,
    write_lock: WriteLock,
    file: Option<DatabaseFile>,
    fail_snapshot_opens: AtomicBool,
}

impl VersionedStore {
    /// Create a store that lives only in memory
    pub fn in_memory() -> Self {
        Self::with_initial(Snapshot::empty(), None)
    }

    /// Open (or create) a store persisted at `path`
    ///
    /// Version numbering continues from the persisted snapshot.
    pub fn open(path: &Path) -> StrataResult<Self> {
        let (file, snapshot) = DatabaseFile::open(path)?;
        let snapshot = snapshot.unwrap_or_else(Snapshot::empty);
        info!(
            target: "strata::storage",
            path = %path.display(),
            version = %snapshot.version(),
            "Opened versioned store"
        );
        Ok(Self::with_initial(snapshot, Some(file)))
    }

    fn with_initial(snapshot: Snapshot, file: Option<DatabaseFile>) -> Self {
        let mut history = BTreeMap::new();
        history.insert(snapshot.version().transaction_sequence, Arc::new(snapshot));
        VersionedStore {
            history: RwLock::new(history),
            write_lock: WriteLock::new(),
            file,
            fail_snapshot_opens: AtomicBool::new(false),
        }
    }

    /// Whether commits are written to a file
    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    /// Number of snapshots currently retained
    pub fn retained_versions(&self) -> usize {
        self.history.read().len()
    }

    /// Size of the persisted file in bytes (0 for in-memory stores)
    pub fn file_size(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| std::fs::metadata(f.path()).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Drop every snapshot but the newest and rewrite the file from it
    ///
    /// Only valid when nothing still reads an older snapshot.
    pub fn compact(&self) -> StrataResult<usize> {
        self.compact_before(self.latest_version().transaction_sequence)
    }

    /// Drop snapshots older than `transaction_sequence` and rewrite the file
    /// from the newest one
    pub fn compact_before(&self, transaction_sequence: u64) -> StrataResult<usize> {
        let latest = self.latest_snapshot()?;
        let released = self.gc_versions_before(transaction_sequence);
        if let Some(file) = &self.file {
            file.persist(&latest)?;
        }
        info!(target: "strata::storage", released, "Compacted store");
        Ok(released)
    }

    /// Make every subsequent `open_snapshot` fail (fault injection)
    pub fn set_fail_snapshot_opens(&self, fail: bool) {
        self.fail_snapshot_opens.store(fail, Ordering::SeqCst);
    }
}

impl Storage for VersionedStore {
    fn latest_version(&self) -> VersionClock {
        self.history
            .read()
            .values()
            .next_back()
            .map(|s| s.version())
            .unwrap_or_default()
    }

    fn open_snapshot(&self, transaction_sequence: u64) -> StrataResult<Arc<Snapshot>> {
        if self.fail_snapshot_opens.load(Ordering::SeqCst) {
            return Err(StrataError::storage(format!(
                "unable to open snapshot at version {}",
                transaction_sequence
            )));
        }
        self.history
            .read()
            .get(&transaction_sequence)
            .cloned()
            .ok_or_else(|| {
                StrataError::storage(format!(
                    "snapshot at version {} is no longer available",
                    transaction_sequence
                ))
            })
    }

    fn commit(&self, txn: WriteTransaction) -> StrataResult<VersionClock> {
        if !self.write_lock.is_held() {
            return Err(StrataError::internal("commit without holding the write lock"));
        }

        let mut history = self.history.write();
        let latest = history
            .values()
            .next_back()
            .map(|s| s.version())
            .unwrap_or_default();
        if txn.base_version() != latest {
            return Err(StrataError::storage(format!(
                "write transaction based on {} but latest is {}",
                txn.base_version(),
                latest
            )));
        }

        let version = if txn.schema_version() != latest.schema_version {
            latest.next_commit_with_schema(txn.schema_version())
        } else {
            latest.next_commit()
        };
        let snapshot = txn.into_snapshot(version);

        if let Some(file) = &self.file {
            file.persist(&snapshot)?;
        }

        history.insert(version.transaction_sequence, Arc::new(snapshot));
        debug!(target: "strata::storage", %version, "Committed");
        Ok(version)
    }

    fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }

    fn gc_versions_before(&self, transaction_sequence: u64) -> usize {
        let mut history = self.history.write();
        let newest = match history.keys().next_back() {
            Some(v) => *v,
            None => return 0,
        };
        let cutoff = transaction_sequence.min(newest);
        let keep = history.split_off(&cutoff);
        let released = history.len();
        *history = keep;
        if released > 0 {
            debug!(target: "strata::storage", released, cutoff, "Released old snapshots");
        }
        released
    }
}
