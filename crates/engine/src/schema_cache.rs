//! Per-coordinator schema cache
//!
//! Remembers the most recently observed schema together with the schema
//! version and the transaction it was read at. The on-disk schema stays
//! authoritative: readers only use the cached entry when its transaction
//! equals the snapshot they are pinned to.

use strata_core::Schema;

/// Cached schema plus the versions it is valid for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCacheEntry {
    /// The schema
    pub schema: Schema,
    /// Schema version the schema was written with
    pub schema_version: u64,
    /// Newest transaction the schema is known to be current at
    pub transaction_sequence: u64,
}

/// Best-effort cache of the newest known schema
#[derive(Debug, Default)]
pub struct SchemaCache {
    entry: Option<SchemaCacheEntry>,
}

impl SchemaCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a schema observed at `transaction_sequence`
    ///
    /// Empty schemas carry no information and are ignored. An offer older
    /// than the cached entry loses; an equal or newer one replaces it.
    pub fn cache(&mut self, schema: &Schema, schema_version: u64, transaction_sequence: u64) {
        if schema.is_empty() {
            return;
        }
        if let Some(entry) = &self.entry {
            if transaction_sequence < entry.transaction_sequence {
                return;
            }
        }
        self.entry = Some(SchemaCacheEntry {
            schema: schema.clone(),
            schema_version,
            transaction_sequence,
        });
    }

    /// Current entry, if any
    pub fn get(&self) -> Option<&SchemaCacheEntry> {
        self.entry.as_ref()
    }

    /// Record that no schema change happened in `(begin, end]`
    ///
    /// Only moves the entry forward when it is known to be current at some
    /// point inside the interval.
    pub fn advance(&mut self, begin: u64, end: u64) {
        if let Some(entry) = &mut self.entry {
            if begin <= entry.transaction_sequence && entry.transaction_sequence <= end {
                entry.transaction_sequence = end;
            }
        }
    }
}
