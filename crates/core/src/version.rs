//! Version clock
//!
//! Every snapshot is identified by a [`VersionClock`], the pair
//! `(schema_version, transaction_sequence)`.
//!
//! ## Ordering
//!
//! - `transaction_sequence` strictly increases on every commit, so it alone
//!   totally orders snapshots of one file.
//! - `schema_version` only changes through an explicit schema update and is
//!   used as a tie-break.
//!
//! An uninitialized file carries [`NOT_VERSIONED`] as its schema version.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Schema version of a file that has never had a schema written
pub const NOT_VERSIONED: u64 = u64::MAX;

/// Ordered `(schema_version, transaction_sequence)` pair identifying a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionClock {
    /// Schema version in effect at this snapshot
    pub schema_version: u64,
    /// Commit counter; strictly increasing per commit
    pub transaction_sequence: u64,
}

impl VersionClock {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Clock of a freshly created, unversioned file
    pub const fn initial() -> Self {
        VersionClock {
            schema_version: NOT_VERSIONED,
            transaction_sequence: 0,
        }
    }

    /// Create a clock
    pub const fn new(schema_version: u64, transaction_sequence: u64) -> Self {
        VersionClock {
            schema_version,
            transaction_sequence,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// The clock after one more commit that keeps the schema version
    #[inline]
    pub const fn next_commit(&self) -> Self {
        VersionClock {
            schema_version: self.schema_version,
            transaction_sequence: self.transaction_sequence + 1,
        }
    }

    /// The clock after one more commit that sets a new schema version
    #[inline]
    pub const fn next_commit_with_schema(&self, schema_version: u64) -> Self {
        VersionClock {
            schema_version,
            transaction_sequence: self.transaction_sequence + 1,
        }
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Whether `self` identifies a strictly newer snapshot than `other`
    #[inline]
    pub fn is_newer_than(&self, other: &VersionClock) -> bool {
        self > other
    }

    /// Whether a schema has ever been written at this version
    #[inline]
    pub const fn is_versioned(&self) -> bool {
        self.schema_version != NOT_VERSIONED
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        VersionClock::initial()
    }
}

impl Ord for VersionClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.transaction_sequence
            .cmp(&other.transaction_sequence)
            .then(self.schema_version.cmp(&other.schema_version))
    }
}

impl PartialOrd for VersionClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_versioned() {
            write!(f, "v{}@{}", self.schema_version, self.transaction_sequence)
        } else {
            write!(f, "unversioned@{}", self.transaction_sequence)
        }
    }
}
