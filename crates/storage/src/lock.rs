//! Exclusive write lock
//!
//! At most one write transaction may be open across every handle sharing a
//! file. [`WriteLock::acquire`] blocks the calling thread until the lock is
//! free.

use parking_lot::{Condvar, Mutex};
use strata_core::{StrataError, StrataResult};
use tracing::trace;

/// Blocking, owner-tagged mutual exclusion for writers
#[derive(Debug, Default)]
pub struct WriteLock {
    owner: Mutex<Option<u64>>,
    released: Condvar,
}

impl WriteLock {
    /// Create an unlocked write lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free, then take it for `owner`
    pub fn acquire(&self, owner: u64) {
        let mut current = self.owner.lock();
        while current.is_some() {
            trace!(target: "strata::storage", owner, holder = ?*current, "Waiting for write lock");
            self.released.wait(&mut current);
        }
        *current = Some(owner);
    }

    /// Release the lock held by `owner`
    pub fn release(&self, owner: u64) -> StrataResult<()> {
        let mut current = self.owner.lock();
        match *current {
            Some(holder) if holder == owner => {
                *current = None;
                drop(current);
                self.released.notify_one();
                Ok(())
            }
            other => Err(StrataError::internal(format!(
                "write lock released by {} while held by {:?}",
                owner, other
            ))),
        }
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<u64> {
        *self.owner.lock()
    }

    /// Whether any writer holds the lock
    pub fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }
}
