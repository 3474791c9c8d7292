//! Per-thread database handles
//!
//! A [`Handle`] is one thread's (or one execution context's) view of a
//! database file. It pins one snapshot at a time and only moves that pin
//! when asked to: by `refresh()`, by `notify()` with auto-refresh enabled, or
//! by starting a write, which always reads the newest version.
//!
//! The module is split by concern:
//! - `transaction`: write transactions and data access
//! - `delivery`: notification rounds, `notify()` and `refresh()`
//! - `schema`: initialization and schema updates
//!
//! # Threading
//!
//! A handle is bound to the thread that opened it unless its config names an
//! execution context. Every public operation except [`Handle::close`] checks
//! the binding and fails with `IncorrectThread`.
//!
//! # Reentrancy
//!
//! Hooks and callbacks run with no handle lock held and may call back into
//! the handle. While a callback runs the handle counts as *delivering*:
//! nested `refresh()` and `notify()` do nothing, and a nested
//! `begin_transaction()` skips waiting and delivering.

mod delivery;
mod schema;
mod transaction;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use strata_core::{Query, Schema, StrataError, StrataResult, NOT_VERSIONED};
use strata_storage::{Snapshot, Storage, VersionedStore, WriteTransaction};
use tracing::{debug, warn};

use crate::binding::{BindingContext, Scheduler};
use crate::config::{Config, ExecutionContextId, SchemaMode};
use crate::coordinator::Coordinator;
use crate::notifier::Notifier;

/// Reference-counted handle
pub type SharedHandle = Arc<Handle>;

/// What a handle is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Affinity {
    Thread(ThreadId),
    Context(ExecutionContextId),
}

impl Affinity {
    pub(crate) fn for_config(config: &Config) -> Self {
        match config.execution_context {
            Some(context) => Affinity::Context(context),
            None => Affinity::Thread(std::thread::current().id()),
        }
    }
}

struct Subscription {
    notifier: Arc<Notifier>,
    token: u64,
}

pub(crate) struct HandleState {
    closed: bool,
    pinned: Option<Arc<Snapshot>>,
    write: Option<WriteTransaction>,
    auto_refresh: bool,
    /// Callbacks currently running on this handle
    delivering: u32,
    schema: Schema,
    schema_version: u64,
    /// In registration order
    subscriptions: Vec<Subscription>,
    notifiers: HashMap<Query, Arc<Notifier>>,
    /// Suppressions to apply when the current write commits
    pending_suppress: Vec<(Arc<Notifier>, u64)>,
}

/// One thread's view of a database file
pub struct Handle {
    id: u64,
    coordinator: Arc<Coordinator>,
    store: Arc<VersionedStore>,
    config: Config,
    affinity: Affinity,
    dynamic_schema: bool,
    self_ref: Weak<Handle>,
    state: Mutex<HandleState>,
    binding: Mutex<Option<Arc<dyn BindingContext>>>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
}

/// Marks the handle as delivering until dropped
struct DeliveringGuard<'a> {
    handle: &'a Handle,
}

impl Drop for DeliveringGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.handle.state.lock();
        state.delivering = state.delivering.saturating_sub(1);
    }
}

impl Handle {
    /// Open a handle with `config`
    ///
    /// Shorthand for looking up the coordinator of `config.path` and opening
    /// a handle through it.
    pub fn open(config: Config) -> StrataResult<SharedHandle> {
        let coordinator = Coordinator::get_coordinator(&config.path)?;
        coordinator.open_handle(config)
    }

    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        store: Arc<VersionedStore>,
        id: u64,
        config: Config,
        affinity: Affinity,
    ) -> SharedHandle {
        let dynamic_schema = config.schema.is_none();
        let auto_refresh = config.options.auto_refresh;
        Arc::new_cyclic(|self_ref| Handle {
            id,
            coordinator,
            store,
            config,
            affinity,
            dynamic_schema,
            self_ref: self_ref.clone(),
            state: Mutex::new(HandleState {
                closed: false,
                pinned: None,
                write: None,
                auto_refresh,
                delivering: 0,
                schema: Schema::empty(),
                schema_version: NOT_VERSIONED,
                subscriptions: Vec::new(),
                notifiers: HashMap::new(),
                pending_suppress: Vec::new(),
            }),
            binding: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Identifier unique within the coordinator; also the write lock owner
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The configuration the handle was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The coordinator shared by every handle on this file
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Schema this handle works with
    ///
    /// The declared schema for handles opened with one, otherwise the schema
    /// of the pinned snapshot.
    pub fn schema(&self) -> Schema {
        self.state.lock().schema.clone()
    }

    /// Schema version of the file as last observed by this handle
    pub fn schema_version(&self) -> u64 {
        self.state.lock().schema_version
    }

    /// Whether the schema follows the file instead of a declared one
    pub fn is_dynamic(&self) -> bool {
        self.dynamic_schema
    }

    /// Transaction of the pinned snapshot, if any
    pub fn pinned_version(&self) -> Option<u64> {
        self.state
            .lock()
            .pinned
            .as_ref()
            .map(|s| s.version().transaction_sequence)
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a snapshot is pinned; false once closed
    pub fn is_in_read_transaction(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.pinned.is_some()
    }

    /// Whether a write transaction is open; false once closed
    pub fn is_in_transaction(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.write.is_some()
    }

    /// Whether `notify()` advances the read automatically
    pub fn auto_refresh(&self) -> bool {
        self.state.lock().auto_refresh
    }

    /// Enable or disable auto-refresh
    pub fn set_auto_refresh(&self, auto_refresh: bool) {
        self.state.lock().auto_refresh = auto_refresh;
    }

    /// Install the binding context receiving this handle's hooks
    pub fn set_binding_context(&self, binding: Arc<dyn BindingContext>) {
        let previous = self.binding.lock().replace(binding);
        drop(previous);
    }

    /// Remove the binding context; hooks stop firing
    pub fn clear_binding_context(&self) {
        let previous = self.binding.lock().take();
        drop(previous);
    }

    /// Install the scheduler the coordinator uses to request `notify()`
    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        let previous = self.scheduler.lock().replace(scheduler);
        drop(previous);
    }

    pub(crate) fn schedule_notify(&self) {
        let scheduler = self.scheduler.lock().clone();
        if let Some(scheduler) = scheduler {
            if !self.is_closed() {
                scheduler.schedule_notify();
            }
        }
    }

    fn binding(&self) -> Option<Arc<dyn BindingContext>> {
        self.binding.lock().clone()
    }

    fn storage(&self) -> &dyn Storage {
        self.store.as_ref()
    }

    fn enter_delivery(&self) -> DeliveringGuard<'_> {
        self.state.lock().delivering += 1;
        DeliveringGuard { handle: self }
    }

    // =========================================================================
    // Threading
    // =========================================================================

    /// Fail with `IncorrectThread` when called off the handle's thread
    pub fn verify_thread(&self) -> StrataResult<()> {
        match self.affinity {
            Affinity::Context(_) => Ok(()),
            Affinity::Thread(owner) if owner == std::thread::current().id() => Ok(()),
            Affinity::Thread(_) => Err(StrataError::IncorrectThread),
        }
    }

    fn check_open(&self) -> StrataResult<()> {
        if self.is_closed() {
            return Err(StrataError::ClosedHandle);
        }
        self.verify_thread()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The pinned snapshot, pinning the newest one if nothing is pinned
    ///
    /// Inside a write this is the snapshot the write started from.
    pub fn read_group(&self) -> StrataResult<Arc<Snapshot>> {
        self.check_open()?;
        if let Some(pinned) = self.state.lock().pinned.clone() {
            return Ok(pinned);
        }
        let snapshot = self.storage().latest_snapshot()?;
        let mut state = self.state.lock();
        if let Some(pinned) = &state.pinned {
            return Ok(Arc::clone(pinned));
        }
        self.adopt_snapshot(&mut state, &snapshot);
        self.set_pinned(&mut state, Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// Release the pinned snapshot, cancelling any open write
    ///
    /// Does nothing while delivering.
    pub fn invalidate(&self) -> StrataResult<()> {
        self.check_open()?;
        let write = {
            let mut state = self.state.lock();
            if state.delivering > 0 {
                return Ok(());
            }
            state.pending_suppress.clear();
            self.set_pinned(&mut state, None);
            state.write.take()
        };
        if write.is_some() {
            self.store.write_lock().release(self.id)?;
        }
        Ok(())
    }

    /// Release old snapshots and rewrite the file from the newest one
    ///
    /// Fails while in a write or while other handles are open on the file.
    /// Snapshots this handle's pin or notifiers still need are kept.
    pub fn compact(&self) -> StrataResult<usize> {
        self.check_open()?;
        if self.state.lock().write.is_some() {
            return Err(StrataError::invalid_transaction(
                "Cannot compact while in a write transaction",
            ));
        }
        self.coordinator.compact(self.id)
    }

    fn set_pinned(&self, state: &mut HandleState, snapshot: Option<Arc<Snapshot>>) {
        let version = snapshot.as_ref().map(|s| s.version().transaction_sequence);
        state.pinned = snapshot;
        self.coordinator.record_pin(self.id, version);
    }

    /// Take over the schema of `new`, which is about to be pinned
    ///
    /// Keeps the coordinator's schema cache current and returns the new
    /// schema when this handle's schema changed.
    fn adopt_snapshot(&self, state: &mut HandleState, new: &Snapshot) -> Option<Schema> {
        let version = new.version();
        let unchanged = state.pinned.as_deref().is_some_and(|old| {
            old.version().schema_version == version.schema_version && old.schema() == new.schema()
        });
        if let (true, Some(old)) = (unchanged, state.pinned.as_deref()) {
            self.coordinator.advance_schema_cache(
                old.version().transaction_sequence,
                version.transaction_sequence,
            );
        }
        state.schema_version = version.schema_version;

        if !self.dynamic_schema {
            if !unchanged {
                self.coordinator.cache_schema(
                    new.schema(),
                    version.schema_version,
                    version.transaction_sequence,
                );
            }
            return None;
        }
        let schema = if unchanged {
            state.schema.clone()
        } else {
            self.read_schema(new)
        };
        if schema != state.schema {
            state.schema = schema.clone();
            return Some(schema);
        }
        None
    }

    /// Schema of `snapshot`, served from the cache when it matches exactly
    fn read_schema(&self, snapshot: &Snapshot) -> Schema {
        let version = snapshot.version();
        if let Some((schema, _, transaction_sequence)) = self.coordinator.get_cached_schema() {
            if transaction_sequence == version.transaction_sequence {
                return schema;
            }
        }
        let schema = self.storage().read_schema(snapshot);
        self.coordinator.cache_schema(
            &schema,
            version.schema_version,
            version.transaction_sequence,
        );
        schema
    }

    /// Fail when another handle changed the schema incompatibly
    ///
    /// Only declared schemas under the automatic and additive modes are
    /// checked; other modes either own the schema or accept any change.
    fn check_external_schema(&self, old: Option<&Snapshot>, new: &Snapshot) -> StrataResult<()> {
        let Some(declared) = &self.config.schema else {
            return Ok(());
        };
        if !matches!(
            self.config.schema_mode,
            SchemaMode::Automatic | SchemaMode::Additive
        ) {
            return Ok(());
        }
        match old {
            Some(old) if old.schema() != new.schema() => declared.check_additive(new.schema()),
            _ => Ok(()),
        }
    }

    /// Pin the snapshot at `target`, firing change hooks around it
    ///
    /// Returns whether the pin moved. With nothing pinned before, the pin is
    /// set without hooks.
    fn advance_read(&self, target: u64) -> StrataResult<bool> {
        let snapshot = self.storage().open_snapshot(target)?;
        let old = {
            let state = self.state.lock();
            if state.closed {
                return Ok(false);
            }
            state.pinned.clone()
        };
        if old
            .as_ref()
            .is_some_and(|old| old.version().transaction_sequence >= target)
        {
            return Ok(false);
        }
        self.check_external_schema(old.as_deref(), &snapshot)?;

        let binding = self.binding();
        if old.is_some() {
            if let Some(binding) = &binding {
                binding.will_change(self);
            }
        }

        let schema_changed = {
            let mut state = self.state.lock();
            if state.closed
                || state
                    .pinned
                    .as_ref()
                    .is_some_and(|p| p.version().transaction_sequence >= target)
            {
                return Ok(false);
            }
            let changed = self.adopt_snapshot(&mut state, &snapshot);
            self.set_pinned(&mut state, Some(snapshot));
            changed
        };
        debug!(target: "strata::handle", handle = self.id, version = target, "Read advanced");

        if let Some(binding) = &binding {
            if let Some(schema) = &schema_changed {
                binding.schema_did_change(self, schema);
            }
            if old.is_some() {
                let _delivering = self.enter_delivery();
                binding.did_change(self, true);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the handle
    ///
    /// Cancels any open write, releases the pin and detaches every notifier.
    /// Idempotent; later operations fail with `ClosedHandle` (or
    /// `InvalidTransaction` for commit and cancel).
    pub fn close(&self) {
        let (write, subscriptions, notifiers, suppressed) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.set_pinned(&mut state, None);
            (
                state.write.take(),
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.notifiers),
                std::mem::take(&mut state.pending_suppress),
            )
        };
        if write.is_some() {
            if let Err(e) = self.store.write_lock().release(self.id) {
                warn!(target: "strata::handle", handle = self.id, error = %e, "Releasing write lock on close failed");
            }
        }

        let mut detached = Vec::new();
        for notifier in notifiers.values() {
            detached.extend(notifier.detach());
        }
        drop(detached);
        drop(subscriptions);
        drop(notifiers);
        drop(suppressed);

        let binding = self.binding.lock().take();
        drop(binding);
        let scheduler = self.scheduler.lock().take();
        drop(scheduler);

        self.coordinator.unregister_handle(self.id);
        debug!(target: "strata::handle", handle = self.id, "Handle closed");
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("path", &self.config.path)
            .field("affinity", &self.affinity)
            .finish()
    }
}
