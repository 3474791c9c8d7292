//! Immutable snapshots
//!
//! A [`Snapshot`] is a point-in-time copy of every table plus the schema in
//! effect at its [`VersionClock`]. Snapshots are shared as `Arc<Snapshot>` and
//! never change once committed.
//!
//! # Design Notes
//!
//! - **Deep clone**: a write transaction clones the tables of its base
//!   snapshot and commits a new snapshot wholesale
//! - **Thread-safe**: snapshots are read concurrently by handles and by
//!   notifier workers

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use strata_core::{Query, Schema, Value, VersionClock};

/// Stable identity of one object within its table
///
/// Keys are allocated monotonically per table and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(pub u64);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Property values of one object
pub type Object = BTreeMap<String, Value>;

/// All objects of one type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub(crate) rows: BTreeMap<RowKey, Object>,
    pub(crate) next_key: u64,
}

impl Table {
    /// Number of objects
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no objects
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up one object
    pub fn get(&self, key: RowKey) -> Option<&Object> {
        self.rows.get(&key)
    }

    /// Objects in key (insertion) order
    pub fn iter(&self) -> impl Iterator<Item = (RowKey, &Object)> {
        self.rows.iter().map(|(k, v)| (*k, v))
    }

    pub(crate) fn allocate_key(&mut self) -> RowKey {
        let key = RowKey(self.next_key);
        self.next_key += 1;
        key
    }
}

/// Immutable view of the database at one version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub(crate) version: VersionClock,
    pub(crate) schema: Schema,
    pub(crate) tables: BTreeMap<String, Table>,
}

impl Snapshot {
    /// The empty snapshot of a new file
    pub fn empty() -> Self {
        Snapshot {
            version: VersionClock::initial(),
            schema: Schema::empty(),
            tables: BTreeMap::new(),
        }
    }

    /// Version of this snapshot
    pub fn version(&self) -> VersionClock {
        self.version
    }

    /// Schema in effect at this snapshot
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Table for an object type
    pub fn table(&self, object_type: &str) -> Option<&Table> {
        self.tables.get(object_type)
    }

    /// Number of objects of a type (0 for unknown types)
    pub fn object_count(&self, object_type: &str) -> usize {
        self.table(object_type).map(Table::len).unwrap_or(0)
    }

    /// Value of one property of one object
    pub fn get_value(&self, object_type: &str, key: RowKey, property: &str) -> Option<&Value> {
        self.table(object_type)?.get(key)?.get(property)
    }

    /// Evaluate a query: filtered, then sorted, rows in result order
    ///
    /// Unknown object types produce empty results rather than an error so
    /// that subscriptions can be made before the type exists.
    pub fn evaluate(&self, query: &Query) -> Vec<(RowKey, &Object)> {
        evaluate(&self.tables, query)
    }

    /// Keys of a query's results in result order
    pub fn keys(&self, query: &Query) -> Vec<RowKey> {
        self.evaluate(query).into_iter().map(|(k, _)| k).collect()
    }
}

pub(crate) fn evaluate<'a>(
    tables: &'a BTreeMap<String, Table>,
    query: &Query,
) -> Vec<(RowKey, &'a Object)> {
    let table = match tables.get(&query.object_type) {
        Some(table) => table,
        None => return Vec::new(),
    };

    let mut rows: Vec<(RowKey, &Object)> = table
        .iter()
        .filter(|(_, object)| query.predicate.matches(&|name: &str| object.get(name)))
        .collect();

    if let Some(sort) = &query.sort {
        rows.sort_by(|(_, a), (_, b)| {
            let ord = match (a.get(&sort.property), b.get(&sort.property)) {
                (Some(x), Some(y)) => x.sort_cmp(y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if sort.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }

    rows
}
