//! Per-query change notifiers
//!
//! A [`Notifier`] belongs to one handle and one query shape. It keeps the
//! callbacks registered for that query in registration order and, for each
//! of them, the version of the results last delivered (its *baseline*).
//!
//! A coordinator pass calls [`Notifier::run`] on a worker thread: every
//! callback gets the change set from its baseline to the pass target,
//! computed through the storage collaborator. The handle later takes those
//! results on its own thread with [`Notifier::take_delivery`]; a result is
//! only delivered if the callback's baseline has not moved since it was
//! computed.
//!
//! # Design Notes
//!
//! - **Coalescing**: every pass diffs baseline -> target directly, so a
//!   sequence of commits that cancels out produces an empty change set
//! - **Skip**: a callback marked with skip version S uses S as its base
//!   when its baseline is exactly S - 1, excluding that commit for it alone
//! - **Errors**: a pass that cannot open a snapshot latches the error; each
//!   callback then receives it once and the notifier never runs again

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use strata_core::{ChangeSet, NotifierError, Query, StrataError};
use strata_storage::Storage;
use tracing::{debug, warn};

/// Callback receiving change sets, or the notifier's error
pub type Callback = Box<dyn FnMut(&ChangeSet, Option<&NotifierError>) + Send>;

/// Shared, lockable callback
pub(crate) type SharedCallback = Arc<Mutex<Callback>>;

struct CallbackEntry {
    token: u64,
    callback: SharedCallback,
    baseline: Option<u64>,
    delivered_once: bool,
    skip_version: Option<u64>,
    error_delivered: bool,
}

impl CallbackEntry {
    fn effective_base(&self, target: u64) -> Option<u64> {
        match (self.skip_version, self.baseline) {
            (Some(skip), Some(baseline)) if baseline + 1 == skip && skip <= target => Some(skip),
            _ => self.baseline,
        }
    }
}

struct PendingResult {
    baseline: Option<u64>,
    changes: ChangeSet,
}

#[derive(Default)]
struct NotifierState {
    entries: Vec<CallbackEntry>,
    next_token: u64,
    ready_version: Option<u64>,
    delivered_version: Option<u64>,
    pending: HashMap<u64, PendingResult>,
    error: Option<NotifierError>,
    detached: bool,
}

/// Where a notifier stands relative to the passes run so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifierStatus {
    /// No callbacks: nothing to wait for
    Idle,
    /// Error latched: never runs again
    Errored,
    /// Callbacks exist but no pass has computed results yet
    Pending,
    /// Results computed for this transaction
    Ready(u64),
}

/// One result handed to the handle for delivery
pub(crate) struct Delivery {
    pub(crate) callback: SharedCallback,
    pub(crate) changes: ChangeSet,
    pub(crate) error: Option<NotifierError>,
}

/// Change-set producer for one query of one handle
pub struct Notifier {
    id: u64,
    handle_id: u64,
    query: Query,
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub(crate) fn new(id: u64, handle_id: u64, query: Query) -> Self {
        Notifier {
            id,
            handle_id,
            query,
            state: Mutex::new(NotifierState::default()),
        }
    }

    /// Identifier unique within the coordinator
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The query this notifier watches
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Transaction the current results were computed for
    pub fn ready_version(&self) -> Option<u64> {
        self.state.lock().ready_version
    }

    /// The latched error, if a pass failed
    pub fn error(&self) -> Option<NotifierError> {
        self.state.lock().error.clone()
    }

    // =========================================================================
    // Callback entries
    // =========================================================================

    /// Register a callback; its baseline is the version last delivered
    pub(crate) fn add_callback(&self, callback: Callback) -> u64 {
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        let baseline = state.delivered_version;
        state.entries.push(CallbackEntry {
            token,
            callback: Arc::new(Mutex::new(callback)),
            baseline,
            delivered_once: false,
            skip_version: None,
            error_delivered: false,
        });
        token
    }

    /// Unregister a callback
    ///
    /// The callback is returned so the caller drops it outside the lock.
    pub(crate) fn remove_callback(&self, token: u64) -> Option<SharedCallback> {
        let mut state = self.state.lock();
        state.pending.remove(&token);
        let index = state.entries.iter().position(|e| e.token == token)?;
        Some(state.entries.remove(index).callback)
    }

    /// Drop every callback and pending result; the notifier stops running
    pub(crate) fn detach(&self) -> Vec<SharedCallback> {
        let mut state = self.state.lock();
        state.detached = true;
        state.pending.clear();
        state.entries.drain(..).map(|e| e.callback).collect()
    }

    /// Whether the notifier was detached from its handle
    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Exclude the commit at `version` from the next delivery to `token`
    ///
    /// `None` clears a mark whose commit failed.
    pub(crate) fn set_skip(&self, token: u64, version: Option<u64>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.token == token) {
            entry.skip_version = version;
        }
    }

    pub(crate) fn status(&self) -> NotifierStatus {
        let state = self.state.lock();
        if state.detached || state.entries.is_empty() {
            NotifierStatus::Idle
        } else if state.error.is_some() {
            NotifierStatus::Errored
        } else {
            match state.ready_version {
                // A callback added since the last pass has nothing to deliver yet
                Some(version)
                    if state.entries.iter().all(|e| {
                        (e.delivered_once && e.baseline == Some(version))
                            || state.pending.contains_key(&e.token)
                    }) =>
                {
                    NotifierStatus::Ready(version)
                }
                _ => NotifierStatus::Pending,
            }
        }
    }

    /// Oldest transaction a future pass may still open
    pub(crate) fn oldest_needed_version(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.detached || state.error.is_some() {
            return None;
        }
        state
            .entries
            .iter()
            .filter_map(|e| e.baseline)
            .chain(state.delivered_version)
            .min()
    }

    // =========================================================================
    // Pass (worker thread)
    // =========================================================================

    /// Compute results for every callback at `target`
    pub fn run(&self, storage: &dyn Storage, target: u64) {
        let plan: Vec<(u64, Option<u64>, Option<u64>)> = {
            let state = self.state.lock();
            if state.detached || state.error.is_some() || state.entries.is_empty() {
                return;
            }
            if state.ready_version.is_some_and(|ready| ready > target) {
                return;
            }
            state
                .entries
                .iter()
                .map(|e| (e.token, e.baseline, e.effective_base(target)))
                .collect()
        };

        let target_snapshot = match storage.open_snapshot(target) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.latch(&e),
        };

        let mut by_base: HashMap<u64, ChangeSet> = HashMap::new();
        let mut results = Vec::with_capacity(plan.len());
        for (token, baseline, base) in plan {
            let changes = match base {
                Some(base) if base < target => match by_base.get(&base) {
                    Some(changes) => changes.clone(),
                    None => {
                        let old = match storage.open_snapshot(base) {
                            Ok(snapshot) => snapshot,
                            Err(e) => return self.latch(&e),
                        };
                        let changes = storage.diff(&self.query, &old, &target_snapshot);
                        by_base.insert(base, changes.clone());
                        changes
                    }
                },
                _ => ChangeSet::empty(),
            };
            results.push((token, PendingResult { baseline, changes }));
        }

        let mut state = self.state.lock();
        if state.detached || state.ready_version.is_some_and(|ready| ready > target) {
            return;
        }
        let live: Vec<u64> = state.entries.iter().map(|e| e.token).collect();
        state.pending = results
            .into_iter()
            .filter(|(token, _)| live.contains(token))
            .collect();
        state.ready_version = Some(target);
        debug!(
            target: "strata::notify",
            notifier = self.id,
            handle = self.handle_id,
            version = target,
            callbacks = state.pending.len(),
            "Notifier ready"
        );
    }

    fn latch(&self, cause: &StrataError) {
        let error = NotifierError::from(cause);
        warn!(
            target: "strata::notify",
            notifier = self.id,
            handle = self.handle_id,
            error = %error,
            "Notifier failed"
        );
        let mut state = self.state.lock();
        state.pending.clear();
        state.error = Some(error);
    }

    // =========================================================================
    // Delivery (handle thread)
    // =========================================================================

    /// Take the result for `token` if it was computed for `version`
    ///
    /// Marks the callback as delivered at `version`. Returns `None` when
    /// nothing should fire: no fresh result, a stale one, or a later
    /// delivery with no changes. A latched error is handed out once
    /// regardless of `version`.
    pub(crate) fn take_delivery(&self, token: u64, version: Option<u64>) -> Option<Delivery> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|e| e.token == token)?;

        if let Some(error) = state.error.clone() {
            let entry = &mut state.entries[index];
            if entry.error_delivered {
                return None;
            }
            entry.error_delivered = true;
            return Some(Delivery {
                callback: Arc::clone(&entry.callback),
                changes: ChangeSet::empty(),
                error: Some(error),
            });
        }

        let version = version?;
        if state.ready_version != Some(version) {
            return None;
        }
        let entry_baseline = state.entries[index].baseline;
        if state.entries[index].delivered_once && entry_baseline == Some(version) {
            return None;
        }
        match state.pending.get(&token) {
            Some(result) if result.baseline == entry_baseline => {}
            _ => return None,
        }
        let result = state.pending.remove(&token)?;
        state.delivered_version = state.delivered_version.max(Some(version));

        let entry = &mut state.entries[index];
        entry.baseline = Some(version);
        let first = !entry.delivered_once;
        entry.delivered_once = true;
        if entry.skip_version.is_some_and(|skip| skip <= version) {
            entry.skip_version = None;
        }

        if first || !result.changes.is_empty() {
            Some(Delivery {
                callback: Arc::clone(&entry.callback),
                changes: result.changes,
                error: None,
            })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("id", &self.id)
            .field("handle_id", &self.handle_id)
            .field("query", &self.query)
            .finish()
    }
}
