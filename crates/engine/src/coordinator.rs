//! Per-file coordinator
//!
//! Exactly one [`Coordinator`] is live per canonical database path. It owns
//! everything the handles on that file share: the storage backend (and with
//! it the write lock), the schema cache, the notifier worker pool and the
//! external wake channel.
//!
//! # Passes
//!
//! A pass ([`Coordinator::on_change`]) reads the newest transaction, runs
//! every live notifier against it on the worker pool, then releases old
//! snapshots nobody can still need and asks handles with a scheduler to
//! deliver. Passes are serialized by `pass_lock`; each completed pass bumps
//! `generation` so that handles waiting for readiness can tell passes apart.
//!
//! # Locking
//!
//! Lock order is handle state -> coordinator state. The coordinator never
//! calls into a handle while holding its own state lock, and never drops an
//! upgraded handle there: the drop may close the handle, which unregisters
//! itself here.

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use strata_core::{Schema, StrataError, StrataResult};
use strata_storage::{Storage, VersionedStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::{NotifierPool, PoolStats};
use crate::config::Config;
use crate::handle::{Affinity, Handle, SharedHandle};
use crate::notifier::Notifier;
use crate::registry;
use crate::schema_cache::SchemaCache;
use crate::wake::ExternalWake;

struct Backend {
    store: Arc<VersionedStore>,
    pool: NotifierPool,
}

struct HandleEntry {
    id: u64,
    handle: Weak<Handle>,
    affinity: Affinity,
    cached: bool,
}

#[derive(Default)]
struct CoordinatorState {
    /// Config of the first live handle; later opens must agree with it
    config: Option<Config>,
    handles: Vec<HandleEntry>,
    notifiers: Vec<Weak<Notifier>>,
    /// Pinned transaction per handle id
    pins: HashMap<u64, u64>,
}

/// Shared state of every handle open on one database file
pub struct Coordinator {
    id: Uuid,
    path: PathBuf,
    backend: OnceCell<Backend>,
    schema_cache: Mutex<SchemaCache>,
    state: Mutex<CoordinatorState>,
    pass_lock: Mutex<()>,
    generation: Mutex<u64>,
    pass_done: Condvar,
    next_id: AtomicU64,
    wake: ExternalWake,
}

impl Coordinator {
    // =========================================================================
    // Lookup
    // =========================================================================

    /// Coordinator for `path`, created on first use
    ///
    /// Every caller asking for the same file, from any thread, gets the same
    /// instance for as long as one is alive.
    pub fn get_coordinator(path: impl AsRef<Path>) -> StrataResult<Arc<Coordinator>> {
        registry::get_or_create(path.as_ref(), Coordinator::create)
    }

    /// Coordinator for `path` if one is alive
    pub fn get_existing_coordinator(path: impl AsRef<Path>) -> Option<Arc<Coordinator>> {
        registry::get_existing(path.as_ref())
    }

    fn create(path: PathBuf) -> StrataResult<Coordinator> {
        let wake = ExternalWake::new(&path)?;
        let coordinator = Coordinator {
            id: Uuid::new_v4(),
            path,
            backend: OnceCell::new(),
            schema_cache: Mutex::new(SchemaCache::new()),
            state: Mutex::new(CoordinatorState::default()),
            pass_lock: Mutex::new(()),
            generation: Mutex::new(0),
            pass_done: Condvar::new(),
            next_id: AtomicU64::new(1),
            wake,
        };
        info!(
            target: "strata::coord",
            path = %coordinator.path.display(),
            instance = %coordinator.id,
            "Coordinator created"
        );
        Ok(coordinator)
    }

    /// Canonical path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of this coordinator instance
    pub fn instance_id(&self) -> Uuid {
        self.id
    }

    /// Storage backend, once the first handle has opened it
    pub fn store(&self) -> Option<Arc<VersionedStore>> {
        self.backend.get().map(|b| Arc::clone(&b.store))
    }

    /// The external wake channel
    pub fn wake(&self) -> &ExternalWake {
        &self.wake
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Open a handle with `config`
    ///
    /// The first live handle fixes the active configuration; later opens must
    /// agree with it. With `config.cache` set, an open handle with the same
    /// thread or execution context is returned instead of a new one.
    pub fn open_handle(self: &Arc<Self>, config: Config) -> StrataResult<SharedHandle> {
        config.validate()?;
        let affinity = Affinity::for_config(&config);

        let handle = {
            let mut state = self.state.lock();
            state.handles.retain(|e| e.handle.strong_count() > 0);

            match &state.config {
                Some(active) if !state.handles.is_empty() => {
                    if let Some(reason) = active.mismatch(&config) {
                        return Err(StrataError::mismatched_config(reason));
                    }
                    // A declared schema takes over from handles reading it from disk.
                    if active.schema.is_none() && config.schema.is_some() {
                        state.config = Some(config.clone());
                    }
                }
                _ => state.config = Some(config.clone()),
            }

            if config.cache {
                let cached = state
                    .handles
                    .iter()
                    .filter(|e| e.cached && e.affinity == affinity)
                    .find_map(|e| e.handle.upgrade());
                // Closed handles unregister themselves, so a live entry is open.
                if let Some(existing) = cached {
                    debug!(target: "strata::coord", handle = existing.id(), "Reusing cached handle");
                    return Ok(existing);
                }
            }

            let store = Arc::clone(&self.ensure_backend(&config)?.store);
            let id = self.next_id();
            let handle = Handle::new(Arc::clone(self), store, id, config.clone(), affinity);
            state.handles.push(HandleEntry {
                id,
                handle: Arc::downgrade(&handle),
                affinity,
                cached: config.cache,
            });
            handle
        };

        if let Err(e) = handle.initialize() {
            handle.close();
            return Err(e);
        }
        if config.options.automatic_change_notifications {
            self.wake.start_listener(Arc::downgrade(self))?;
        }
        info!(
            target: "strata::coord",
            path = %self.path.display(),
            handle = handle.id(),
            "Handle opened"
        );
        Ok(handle)
    }

    fn ensure_backend(&self, config: &Config) -> StrataResult<&Backend> {
        let backend = self.backend.get_or_try_init(|| -> StrataResult<Backend> {
            let store = if config.in_memory {
                VersionedStore::in_memory()
            } else {
                VersionedStore::open(&self.path)?
            };
            if let Some(should_compact) = &config.should_compact_on_launch_function {
                if store.is_persistent() {
                    let size = store.file_size();
                    if should_compact(size, size) {
                        store.compact()?;
                    }
                }
            }
            Ok(Backend {
                store: Arc::new(store),
                pool: NotifierPool::new(config.options.notifier_threads)?,
            })
        })?;
        if backend.store.is_persistent() == config.in_memory {
            return Err(StrataError::mismatched_config(format!(
                "Handle at path '{}' already opened with different in-memory settings",
                self.path.display()
            )));
        }
        Ok(backend)
    }

    pub(crate) fn unregister_handle(&self, id: u64) {
        {
            let mut state = self.state.lock();
            state
                .handles
                .retain(|e| e.id != id && e.handle.strong_count() > 0);
            state.pins.remove(&id);
        }
        self.bump_generation();
        debug!(target: "strata::coord", handle = id, "Handle unregistered");
    }

    pub(crate) fn record_pin(&self, handle_id: u64, transaction_sequence: Option<u64>) {
        let mut state = self.state.lock();
        match transaction_sequence {
            Some(version) => state.pins.insert(handle_id, version),
            None => state.pins.remove(&handle_id),
        };
    }

    /// Number of live, open handles
    pub fn handle_count(&self) -> usize {
        let state = self.state.lock();
        state
            .handles
            .iter()
            .filter(|e| e.handle.strong_count() > 0)
            .count()
    }

    /// Panic if any handle on this file is still open
    pub fn assert_no_open_handles(&self) {
        let open = self.handle_count();
        if open > 0 {
            panic!(
                "{} handle(s) still open on '{}'",
                open,
                self.path.display()
            );
        }
    }

    // =========================================================================
    // Notifiers
    // =========================================================================

    pub(crate) fn register_notifier(&self, notifier: &Arc<Notifier>) {
        let mut state = self.state.lock();
        state.notifiers.retain(|n| n.strong_count() > 0);
        state.notifiers.push(Arc::downgrade(notifier));
    }

    /// Number of live notifiers that still have callbacks
    pub fn notifier_count(&self) -> usize {
        let notifiers = self.live_notifiers();
        notifiers.iter().filter(|n| n.callback_count() > 0).count()
    }

    fn live_notifiers(&self) -> Vec<Arc<Notifier>> {
        let mut state = self.state.lock();
        state.notifiers.retain(|n| n.strong_count() > 0);
        state.notifiers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Worker pool metrics, once the backend exists
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.backend.get().map(|b| b.pool.stats())
    }

    /// Signal that a commit happened
    pub(crate) fn signal_commit(&self) {
        self.wake.notify();
    }

    // =========================================================================
    // Passes
    // =========================================================================

    /// Run a pass now
    ///
    /// Blocks while another pass is running, then computes every notifier for
    /// the newest transaction.
    pub fn on_change(&self) {
        let guard = self.pass_lock.lock();
        self.run_pass(guard);
    }

    /// Block until `is_ready` holds
    ///
    /// Runs a pass on the calling thread when none is in progress, otherwise
    /// waits for the running one to finish and checks again.
    pub(crate) fn wait_for_notifiers(&self, is_ready: impl Fn() -> bool) {
        loop {
            let seen = *self.generation.lock();
            if is_ready() {
                return;
            }
            if let Some(guard) = self.pass_lock.try_lock() {
                // A pass started now covers every commit made so far.
                self.run_pass(guard);
                return;
            }
            let mut generation = self.generation.lock();
            while *generation == seen {
                self.pass_done.wait(&mut generation);
            }
        }
    }

    fn run_pass(&self, guard: MutexGuard<'_, ()>) {
        let Some(backend) = self.backend.get() else {
            return;
        };
        let store = Arc::clone(&backend.store);
        let target = store.latest_version().transaction_sequence;
        let notifiers: Vec<Arc<Notifier>> = self
            .live_notifiers()
            .into_iter()
            .filter(|n| !n.is_detached())
            .collect();

        let jobs: Vec<_> = notifiers
            .iter()
            .map(|notifier| {
                let notifier = Arc::clone(notifier);
                let store = Arc::clone(&store);
                move || notifier.run(store.as_ref(), target)
            })
            .collect();
        if let Err(e) = backend.pool.run_batch(jobs) {
            warn!(target: "strata::coord", error = %e, "Pass skipped");
        }
        debug!(
            target: "strata::coord",
            version = target,
            notifiers = notifiers.len(),
            "Pass complete"
        );

        store.gc_versions_before(self.oldest_needed_version(&notifiers, target));
        drop(notifiers);
        // Waiters retry the pass lock once woken.
        drop(guard);
        self.bump_generation();

        let handles: Vec<SharedHandle> = {
            let state = self.state.lock();
            state.handles.iter().filter_map(|e| e.handle.upgrade()).collect()
        };
        for handle in &handles {
            handle.schedule_notify();
        }
    }

    fn bump_generation(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.pass_done.notify_all();
    }

    /// Oldest transaction a pin or a notifier baseline still refers to
    fn oldest_needed_version(&self, notifiers: &[Arc<Notifier>], target: u64) -> u64 {
        let oldest_pin = self.state.lock().pins.values().copied().min();
        notifiers
            .iter()
            .filter_map(|n| n.oldest_needed_version())
            .chain(oldest_pin)
            .min()
            .unwrap_or(target)
            .min(target)
    }

    /// Compact the file for handle `requester`
    ///
    /// Refused while any other handle is open. Versions the requester's pin
    /// or notifiers still need survive.
    pub(crate) fn compact(&self, requester: u64) -> StrataResult<usize> {
        let guard = self.pass_lock.lock();
        let result = self.compact_locked(requester);
        drop(guard);
        self.bump_generation();
        result
    }

    fn compact_locked(&self, requester: u64) -> StrataResult<usize> {
        let others = {
            let state = self.state.lock();
            state
                .handles
                .iter()
                .filter(|e| e.id != requester && e.handle.strong_count() > 0)
                .count()
        };
        if others > 0 {
            return Err(StrataError::invalid_transaction(format!(
                "Cannot compact while {} other handle(s) are open",
                others
            )));
        }
        let Some(backend) = self.backend.get() else {
            return Ok(0);
        };
        let latest = backend.store.latest_version().transaction_sequence;
        let notifiers = self.live_notifiers();
        let cutoff = self.oldest_needed_version(&notifiers, latest);
        drop(notifiers);
        let released = backend.store.compact_before(cutoff)?;
        info!(
            target: "strata::coord",
            handle = requester,
            released,
            cutoff,
            "Compacted"
        );
        Ok(released)
    }

    // =========================================================================
    // Schema cache
    // =========================================================================

    /// Offer a schema observed at `transaction_sequence` to the cache
    pub fn cache_schema(&self, schema: &Schema, schema_version: u64, transaction_sequence: u64) {
        self.schema_cache
            .lock()
            .cache(schema, schema_version, transaction_sequence);
    }

    /// Cached `(schema, schema_version, transaction_sequence)`, if any
    pub fn get_cached_schema(&self) -> Option<(Schema, u64, u64)> {
        self.schema_cache
            .lock()
            .get()
            .map(|e| (e.schema.clone(), e.schema_version, e.transaction_sequence))
    }

    /// Record that no schema change happened in `(begin, end]`
    pub fn advance_schema_cache(&self, begin: u64, end: u64) {
        self.schema_cache.lock().advance(begin, end);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        registry::unregister(&self.path, self as *const Coordinator);
        debug!(target: "strata::coord", path = %self.path.display(), "Coordinator dropped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Panic if any coordinator in the process still has an open handle
pub fn assert_no_open_handles() {
    let coordinators = registry::live_coordinators();
    for coordinator in &coordinators {
        coordinator.assert_no_open_handles();
    }
}
