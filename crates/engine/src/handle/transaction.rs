//! Write transactions and data access

use std::sync::Arc;

use strata_core::{ObjectSchema, Property, Query, StrataError, StrataResult, Value};
use strata_storage::{Object, RowKey, Snapshot, Storage, WriteTransaction};
use tracing::debug;

use super::Handle;
use crate::results::Results;

const OUTSIDE_WRITE: &str = "Cannot modify managed objects outside of a write transaction.";

/// What reads see: the open write, or the pinned snapshot
enum View<'a> {
    Write(&'a WriteTransaction),
    Snapshot(&'a Snapshot),
}

impl View<'_> {
    fn evaluate(&self, query: &Query) -> Vec<(RowKey, &Object)> {
        match self {
            View::Write(txn) => txn.evaluate(query),
            View::Snapshot(snapshot) => snapshot.evaluate(query),
        }
    }
}

impl Handle {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a write transaction at the newest version
    ///
    /// Blocks until no other handle on the file is writing. Outside a
    /// callback, first waits for pending notifiers (when configured to) and
    /// delivers what is ready at the version the write starts from.
    pub fn begin_transaction(&self) -> StrataResult<()> {
        self.check_open()?;
        let nested = {
            let state = self.state.lock();
            if state.write.is_some() {
                return Err(StrataError::invalid_transaction(
                    "The handle is already in a write transaction",
                ));
            }
            state.delivering > 0
        };

        if !nested && self.config.options.wait_for_notifiers_on_write {
            let target = self.storage().latest_version().transaction_sequence;
            self.wait_for_notifiers(target);
        }

        self.store.write_lock().acquire(self.id);
        let prepared = self.prepare_write();
        let (txn, snapshot, old) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.store.write_lock().release(self.id)?;
                return Err(e);
            }
        };
        let moved = old
            .as_ref()
            .map_or(true, |old| old.version() != snapshot.version());
        let fire_change = moved && old.is_some();

        let binding = self.binding();
        if fire_change {
            if let Some(binding) = &binding {
                binding.will_change(self);
            }
        }

        let schema_changed = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                self.store.write_lock().release(self.id)?;
                return Err(StrataError::ClosedHandle);
            }
            let changed = if moved {
                let changed = self.adopt_snapshot(&mut state, &snapshot);
                self.set_pinned(&mut state, Some(Arc::clone(&snapshot)));
                changed
            } else {
                None
            };
            state.write = Some(txn);
            changed
        };
        debug!(
            target: "strata::handle",
            handle = self.id,
            version = snapshot.version().transaction_sequence,
            nested,
            "Write transaction started"
        );

        if let Some(binding) = &binding {
            if let Some(schema) = &schema_changed {
                binding.schema_did_change(self, schema);
            }
            if fire_change {
                let _delivering = self.enter_delivery();
                binding.did_change(self, true);
            }
        }

        if !nested && self.is_in_transaction() {
            let version = snapshot.version().transaction_sequence;
            self.deliver(Some(version));
        }
        Ok(())
    }

    fn prepare_write(
        &self,
    ) -> StrataResult<(WriteTransaction, Arc<Snapshot>, Option<Arc<Snapshot>>)> {
        let txn = self.storage().begin_write()?;
        let snapshot = self
            .storage()
            .open_snapshot(txn.base_version().transaction_sequence)?;
        let old = self.state.lock().pinned.clone();
        if old
            .as_ref()
            .map_or(true, |old| old.version() != snapshot.version())
        {
            self.check_external_schema(old.as_deref(), &snapshot)?;
        }
        Ok((txn, snapshot, old))
    }

    /// Commit the open write transaction
    ///
    /// Pins the committed version, applies any pending suppressions, signals
    /// the other handles and fires `did_change`.
    pub fn commit_transaction(&self) -> StrataResult<()> {
        let (txn, suppressed, old) = {
            let mut state = self.state.lock();
            let txn = match state.write.take() {
                Some(txn) if !state.closed => txn,
                _ => {
                    return Err(StrataError::invalid_transaction(
                        "Can't commit a non-existing write transaction",
                    ))
                }
            };
            if let Err(e) = self.verify_thread() {
                state.write = Some(txn);
                return Err(e);
            }
            (
                txn,
                std::mem::take(&mut state.pending_suppress),
                state.pinned.clone(),
            )
        };

        let schema_changed = txn.schema_changed();
        // The write lock is held, so the commit gets the next sequence number.
        let expected = txn.base_version().transaction_sequence + 1;
        for (notifier, token) in &suppressed {
            notifier.set_skip(*token, Some(expected));
        }

        let committed = self.storage().commit(txn);
        let released = self.store.write_lock().release(self.id);
        let version = match committed {
            Ok(version) => version,
            Err(e) => {
                for (notifier, token) in &suppressed {
                    notifier.set_skip(*token, None);
                }
                return Err(e);
            }
        };
        released?;

        let snapshot = self.storage().open_snapshot(version.transaction_sequence)?;
        let schema_did_change = {
            let mut state = self.state.lock();
            let changed = if schema_changed {
                if self.dynamic_schema {
                    state.schema = snapshot.schema().clone();
                }
                state.schema_version = version.schema_version;
                self.coordinator.cache_schema(
                    snapshot.schema(),
                    version.schema_version,
                    version.transaction_sequence,
                );
                self.dynamic_schema.then(|| state.schema.clone())
            } else {
                if let Some(old) = &old {
                    self.coordinator.advance_schema_cache(
                        old.version().transaction_sequence,
                        version.transaction_sequence,
                    );
                }
                None
            };
            self.set_pinned(&mut state, Some(snapshot));
            changed
        };
        drop(suppressed);

        self.coordinator.signal_commit();
        debug!(target: "strata::handle", handle = self.id, %version, "Committed");

        if let Some(binding) = self.binding() {
            if let Some(schema) = &schema_did_change {
                binding.schema_did_change(self, schema);
            }
            let _delivering = self.enter_delivery();
            binding.did_change(self, true);
        }
        Ok(())
    }

    /// Discard the open write transaction
    pub fn cancel_transaction(&self) -> StrataResult<()> {
        {
            let state = self.state.lock();
            if state.closed || state.write.is_none() {
                return Err(StrataError::invalid_transaction(
                    "Can't cancel a non-existing write transaction",
                ));
            }
        }
        self.verify_thread()?;
        let (write, suppressed) = {
            let mut state = self.state.lock();
            (
                state.write.take(),
                std::mem::take(&mut state.pending_suppress),
            )
        };
        drop(suppressed);
        if write.is_some() {
            self.store.write_lock().release(self.id)?;
            debug!(target: "strata::handle", handle = self.id, "Write transaction cancelled");
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn with_write<R>(
        &self,
        f: impl FnOnce(&mut WriteTransaction) -> StrataResult<R>,
    ) -> StrataResult<R> {
        self.check_open()?;
        let mut state = self.state.lock();
        let txn = state
            .write
            .as_mut()
            .ok_or_else(|| StrataError::invalid_transaction(OUTSIDE_WRITE))?;
        f(txn)
    }

    /// Insert an object; properties not given take their defaults
    pub fn create_object<I, K>(&self, object_type: &str, values: I) -> StrataResult<RowKey>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: Vec<(String, Value)> = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.with_write(|txn| txn.create_object(object_type, values))
    }

    /// Set one property of an object
    pub fn set_value(
        &self,
        object_type: &str,
        key: RowKey,
        property: &str,
        value: Value,
    ) -> StrataResult<()> {
        self.with_write(|txn| txn.set_value(object_type, key, property, value))
    }

    /// Delete an object; returns whether it existed
    pub fn delete_object(&self, object_type: &str, key: RowKey) -> StrataResult<bool> {
        self.with_write(|txn| Ok(txn.delete_object(object_type, key)))
    }

    /// Delete every object of a type
    pub fn delete_all(&self, object_type: &str) -> StrataResult<()> {
        self.with_write(|txn| {
            txn.delete_all(object_type);
            Ok(())
        })
    }

    /// Add an object type to the file's schema
    pub fn add_object_type(&self, object: ObjectSchema) -> StrataResult<()> {
        self.with_write(|txn| txn.add_object_type(object))
    }

    /// Add a property to an existing object type
    pub fn add_property(&self, object_type: &str, property: Property) -> StrataResult<()> {
        self.with_write(|txn| txn.add_property(object_type, property))
    }

    /// Remove a property and its column
    pub fn remove_property(&self, object_type: &str, name: &str) -> StrataResult<()> {
        self.with_write(|txn| txn.remove_property(object_type, name))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn with_view<R>(&self, f: impl FnOnce(View<'_>) -> R) -> StrataResult<R> {
        self.check_open()?;
        {
            let state = self.state.lock();
            if let Some(txn) = &state.write {
                return Ok(f(View::Write(txn)));
            }
        }
        let snapshot = self.read_group()?;
        Ok(f(View::Snapshot(&snapshot)))
    }

    /// Number of objects of a type
    pub fn object_count(&self, object_type: &str) -> StrataResult<usize> {
        self.with_view(|view| match view {
            View::Write(txn) => txn.object_count(object_type),
            View::Snapshot(snapshot) => snapshot.object_count(object_type),
        })
    }

    /// Keys of every object of a type, in insertion order
    pub fn keys(&self, object_type: &str) -> StrataResult<Vec<RowKey>> {
        self.with_view(|view| match view {
            View::Write(txn) => txn.keys(object_type),
            View::Snapshot(snapshot) => snapshot
                .table(object_type)
                .map(|t| t.iter().map(|(key, _)| key).collect())
                .unwrap_or_default(),
        })
    }

    /// One property of one object
    pub fn get_value(
        &self,
        object_type: &str,
        key: RowKey,
        property: &str,
    ) -> StrataResult<Option<Value>> {
        self.with_view(|view| {
            let value = match view {
                View::Write(txn) => txn.get_value(object_type, key, property),
                View::Snapshot(snapshot) => snapshot.get_value(object_type, key, property),
            };
            value.cloned()
        })
    }

    /// Live collection of every object of a type
    pub fn objects(self: &Arc<Self>, object_type: &str) -> Results {
        Results::new(Arc::clone(self), Query::all(object_type))
    }

    /// Live collection for an arbitrary query
    pub fn query(self: &Arc<Self>, query: Query) -> Results {
        Results::new(Arc::clone(self), query)
    }

    /// Keys matching `query`, in result order
    pub(crate) fn evaluate_keys(&self, query: &Query) -> StrataResult<Vec<RowKey>> {
        self.with_view(|view| view.evaluate(query).into_iter().map(|(k, _)| k).collect())
    }

    /// Property of the object at `index` in the results of `query`
    pub(crate) fn evaluate_value(
        &self,
        query: &Query,
        index: usize,
        property: &str,
    ) -> StrataResult<Option<Value>> {
        self.with_view(|view| {
            view.evaluate(query)
                .get(index)
                .and_then(|(_, object)| object.get(property).cloned())
        })
    }

    /// Run `f` inside a write transaction, committing on success
    ///
    /// The write is cancelled when `f` fails.
    pub fn write<R>(&self, f: impl FnOnce(&Handle) -> StrataResult<R>) -> StrataResult<R> {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                if self.is_in_transaction() {
                    self.cancel_transaction()?;
                }
                Err(e)
            }
        }
    }
}
