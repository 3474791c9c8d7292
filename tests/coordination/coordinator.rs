//! Coordinator Identity and Handle Caching Tests
//!
//! - One coordinator per canonical path, shared by every thread
//! - Cached handles per thread or execution context
//! - Uncached handles are always new

use crate::common::*;
use std::sync::Arc;
use std::thread;
use stratalive::ExecutionContextId;

// ============================================================================
// Identity
// ============================================================================

#[test]
fn same_path_shares_one_coordinator_across_threads() {
    let dir = TestDir::new();
    let here = Coordinator::get_coordinator(&dir.path).unwrap();

    let path = dir.path.clone();
    let there = thread::spawn(move || Coordinator::get_coordinator(&path).unwrap())
        .join()
        .unwrap();

    assert!(Arc::ptr_eq(&here, &there));
    assert_eq!(here.instance_id(), there.instance_id());
}

#[test]
fn equivalent_paths_reach_the_same_coordinator() {
    let dir = TestDir::new();
    let here = Coordinator::get_coordinator(&dir.path).unwrap();
    let dotted = dir.dir.path().join(".").join("test.strata");
    let there = Coordinator::get_coordinator(&dotted).unwrap();

    assert!(Arc::ptr_eq(&here, &there));
}

#[test]
fn different_paths_get_different_coordinators() {
    let dir = TestDir::new();
    let a = Coordinator::get_coordinator(dir.dir.path().join("a.strata")).unwrap();
    let b = Coordinator::get_coordinator(dir.dir.path().join("b.strata")).unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_ne!(a.instance_id(), b.instance_id());
}

#[test]
fn coordinator_is_released_with_its_last_reference() {
    let dir = TestDir::new();
    let coordinator = Coordinator::get_coordinator(&dir.path).unwrap();
    assert!(Coordinator::get_existing_coordinator(&dir.path).is_some());

    drop(coordinator);
    assert!(Coordinator::get_existing_coordinator(&dir.path).is_none());
}

#[test]
fn handles_keep_their_coordinator_alive() {
    let dir = TestDir::new();
    let handle = dir.open();
    let id = handle.coordinator().instance_id();

    let existing = Coordinator::get_existing_coordinator(&dir.path).unwrap();
    assert_eq!(existing.instance_id(), id);
    drop(existing);

    handle.close();
    drop(handle);
    assert!(Coordinator::get_existing_coordinator(&dir.path).is_none());
}

#[test]
fn get_existing_does_not_create() {
    let dir = TestDir::new();
    assert!(Coordinator::get_existing_coordinator(&dir.path).is_none());
    assert!(Coordinator::get_existing_coordinator(&dir.path).is_none());
}

// ============================================================================
// Handle caching
// ============================================================================

#[test]
fn cached_handle_is_reused_on_the_same_thread() {
    let dir = TestDir::new();
    let a = dir.open();
    let b = dir.open();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.coordinator().handle_count(), 1);
    a.close();
}

#[test]
fn other_threads_get_their_own_handle() {
    let dir = TestDir::new();
    let here = dir.open();

    let there = dir.on_other_thread(dir.config(), |h| h.id());
    assert_ne!(here.id(), there);
    here.close();
}

#[test]
fn uncached_handles_are_always_new() {
    let dir = TestDir::new();
    let a = dir.open_uncached();
    let b = dir.open_uncached();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.coordinator().handle_count(), 2);
    a.close();
    b.close();
}

#[test]
fn closed_handle_is_not_returned_from_cache() {
    let dir = TestDir::new();
    let a = dir.open();
    a.close();

    let b = dir.open();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!b.is_closed());
    b.close();
}

#[test]
fn execution_context_handles_are_shared_across_threads() {
    let dir = TestDir::new();
    let mut config = dir.config();
    config.execution_context = Some(ExecutionContextId(7));

    let here = Handle::open(config.clone()).unwrap();
    let there = thread::spawn(move || Handle::open(config).unwrap())
        .join()
        .unwrap();

    assert!(Arc::ptr_eq(&here, &there));
    here.close();
}

#[test]
fn execution_context_handles_may_be_used_from_any_thread() {
    let dir = TestDir::new();
    let mut config = dir.config();
    config.execution_context = Some(ExecutionContextId(3));
    let handle = Handle::open(config).unwrap();

    let shared = Arc::clone(&handle);
    thread::spawn(move || insert(&shared, 1)).join().unwrap();

    handle.refresh().unwrap();
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn thread_bound_handle_rejects_other_threads() {
    let dir = TestDir::new();
    let handle = dir.open();

    let shared = Arc::clone(&handle);
    let result = thread::spawn(move || shared.object_count("object").map(|_| ()))
        .join()
        .unwrap();

    assert!(matches!(result, Err(StrataError::IncorrectThread)));
    handle.close();
}

// ============================================================================
// Process-wide checks
// ============================================================================

#[test]
fn no_open_handles_after_close() {
    let dir = TestDir::new();
    let handle = dir.open();
    let coordinator = Arc::clone(handle.coordinator());
    assert_eq!(coordinator.handle_count(), 1);

    handle.close();
    assert_eq!(coordinator.handle_count(), 0);
    coordinator.assert_no_open_handles();
}

#[test]
#[should_panic(expected = "still open")]
fn open_handle_fails_the_assertion() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.coordinator().assert_no_open_handles();
}
