//! Live query results
//!
//! [`Results`] is a query bound to a handle. Reads evaluate the query
//! against whatever the handle currently sees (its open write, otherwise the
//! pinned snapshot), so a `Results` never goes stale. Registering a callback
//! subscribes the query for change sets.

use strata_core::{ChangeSet, NotifierError, Predicate, Query, StrataResult, Value};
use strata_storage::RowKey;

use crate::handle::SharedHandle;
use crate::token::NotificationToken;

/// A query evaluated against one handle
#[derive(Debug, Clone)]
pub struct Results {
    handle: SharedHandle,
    query: Query,
}

impl Results {
    pub(crate) fn new(handle: SharedHandle, query: Query) -> Self {
        Results { handle, query }
    }

    /// The query
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The handle the results read through
    pub fn handle(&self) -> &SharedHandle {
        &self.handle
    }

    /// Narrow the results with another predicate
    pub fn filter(self, predicate: Predicate) -> Results {
        Results {
            query: self.query.filter(predicate),
            handle: self.handle,
        }
    }

    /// Sort by `property`
    pub fn sorted_by(self, property: impl Into<String>, ascending: bool) -> Results {
        Results {
            query: self.query.sorted_by(property, ascending),
            handle: self.handle,
        }
    }

    /// Number of matching objects
    pub fn len(&self) -> StrataResult<usize> {
        Ok(self.keys()?.len())
    }

    /// Whether nothing matches
    pub fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys of the matching objects, in result order
    pub fn keys(&self) -> StrataResult<Vec<RowKey>> {
        self.handle.evaluate_keys(&self.query)
    }

    /// Key of the object at `index`
    pub fn get(&self, index: usize) -> StrataResult<Option<RowKey>> {
        Ok(self.keys()?.get(index).copied())
    }

    /// `property` of the object at `index`
    pub fn value(&self, index: usize, property: &str) -> StrataResult<Option<Value>> {
        self.handle.evaluate_value(&self.query, index, property)
    }

    /// Call `callback` with the change set whenever the results change
    ///
    /// The first call reports the initial state and may be empty. If the
    /// notifier fails, the callback receives the error once and is not
    /// called again.
    pub fn add_notification_callback<F>(&self, callback: F) -> StrataResult<NotificationToken>
    where
        F: FnMut(&ChangeSet, Option<&NotifierError>) + Send + 'static,
    {
        self.handle
            .add_notification_callback(self.query.clone(), Box::new(callback))
    }
}
