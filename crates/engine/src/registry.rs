//! Global coordinator registry for singleton management
//!
//! Ensures only one Coordinator exists per canonical database path.
//! Uses weak references so a coordinator is released when its last handle
//! drops.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use strata_core::{StrataError, StrataResult};

use crate::coordinator::Coordinator;

// =============================================================================
// Global Coordinator Registry
// =============================================================================
//
// Opening the same path twice, from any thread, must reach the same
// Coordinator so that every handle shares one write lock, one schema cache
// and one set of notifiers. The lock is held across lookup-or-create.
//
// Never drop an upgraded Arc<Coordinator> while holding this lock: the drop
// may be the last reference and Coordinator::drop takes the lock again.

/// Global registry of live coordinators (canonical path -> weak reference)
pub(crate) static COORDINATORS: Lazy<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Canonical identity of a database path
///
/// The parent directory is canonicalized and joined with the file name, so
/// the file itself need not exist yet.
pub fn canonical_path(path: &Path) -> StrataResult<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let file_name = path.file_name().ok_or_else(|| {
        StrataError::invalid_config(format!("'{}' does not name a file", path.display()))
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.canonicalize()?.join(file_name))
}

/// Look up the live coordinator for `path`, or create one with `create`
pub(crate) fn get_or_create<F>(path: &Path, create: F) -> StrataResult<Arc<Coordinator>>
where
    F: FnOnce(PathBuf) -> StrataResult<Coordinator>,
{
    let canonical = canonical_path(path)?;
    let mut registry = COORDINATORS.lock();
    if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let coordinator = Arc::new(create(canonical.clone())?);
    registry.insert(canonical, Arc::downgrade(&coordinator));
    Ok(coordinator)
}

/// Look up the live coordinator for `path` without creating one
pub(crate) fn get_existing(path: &Path) -> Option<Arc<Coordinator>> {
    let canonical = canonical_path(path).ok()?;
    let registry = COORDINATORS.lock();
    registry.get(&canonical).and_then(Weak::upgrade)
}

/// Remove the entry for `path` if it still refers to `coordinator`
pub(crate) fn unregister(path: &Path, coordinator: *const Coordinator) {
    let mut registry = COORDINATORS.lock();
    if registry
        .get(path)
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), coordinator))
    {
        registry.remove(path);
    }
}

/// Every live coordinator
pub(crate) fn live_coordinators() -> Vec<Arc<Coordinator>> {
    let registry = COORDINATORS.lock();
    registry.values().filter_map(Weak::upgrade).collect()
}
