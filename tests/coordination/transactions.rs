//! Write Transaction Tests
//!
//! - One writer at a time across every handle on the file
//! - Reads see the open write, then the committed version
//! - Usage errors for commit, cancel and writes outside a transaction

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn writers_on_different_threads_never_overlap() {
    let dir = TestDir::new();
    let handle = dir.open();
    let writing = Arc::new(AtomicBool::new(false));

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let config = dir.config();
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                let handle = Handle::open(config).unwrap();
                for i in 0..10 {
                    handle
                        .write(|h| {
                            assert!(!writing.swap(true, Ordering::SeqCst), "overlapping writes");
                            h.create_object("object", [("value", Value::Int(t * 100 + i))])?;
                            thread::sleep(Duration::from_millis(1));
                            writing.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
                handle.close();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    handle.refresh().unwrap();
    assert_eq!(handle.object_count("object").unwrap(), 40);
    handle.close();
}

#[test]
fn begin_blocks_while_another_handle_writes() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.begin_transaction().unwrap();

    let config = dir.config();
    let waiter = thread::spawn(move || {
        let other = Handle::open(config).unwrap();
        other.begin_transaction().unwrap();
        let seen = other.object_count("object").unwrap();
        other.cancel_transaction().unwrap();
        other.close();
        seen
    });

    thread::sleep(Duration::from_millis(50));
    handle
        .create_object("object", [("value", Value::Int(1))])
        .unwrap();
    handle.commit_transaction().unwrap();

    // The waiting write starts from the commit it waited for.
    assert_eq!(waiter.join().unwrap(), 1);
    handle.close();
}

#[test]
fn each_commit_advances_the_version_by_one() {
    let dir = TestDir::new();
    let handle = dir.open();
    let before = latest(&handle);

    insert(&handle, 1);
    insert(&handle, 2);

    assert_eq!(latest(&handle), before + 2);
    assert_eq!(handle.pinned_version(), Some(before + 2));
    handle.close();
}

// ============================================================================
// Visibility
// ============================================================================

#[test]
fn reads_inside_a_write_see_uncommitted_changes() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");

    handle.begin_transaction().unwrap();
    let key = handle
        .create_object("object", [("value", Value::Int(3))])
        .unwrap();
    assert_eq!(results.len().unwrap(), 1);
    assert_eq!(
        handle.get_value("object", key, "value").unwrap(),
        Some(Value::Int(3))
    );

    handle.cancel_transaction().unwrap();
    assert_eq!(results.len().unwrap(), 0);
    handle.close();
}

#[test]
fn pinned_reads_ignore_other_commits_until_refresh() {
    let dir = TestDir::new();
    let handle = dir.open();
    assert_eq!(handle.object_count("object").unwrap(), 0);

    dir.insert_elsewhere(1);
    assert_eq!(handle.object_count("object").unwrap(), 0);

    handle.refresh().unwrap();
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn begin_transaction_moves_to_the_newest_version() {
    let dir = TestDir::new();
    let handle = dir.open();
    dir.insert_elsewhere(1);

    handle.begin_transaction().unwrap();
    assert_eq!(handle.object_count("object").unwrap(), 1);
    assert_eq!(handle.pinned_version(), Some(latest(&handle)));
    handle.cancel_transaction().unwrap();
    handle.close();
}

#[test]
fn reads_pin_a_snapshot_lazily() {
    let dir = TestDir::new();
    let handle = dir.open_uncached();
    handle.invalidate().unwrap();
    assert!(!handle.is_in_read_transaction());

    handle.object_count("object").unwrap();
    assert!(handle.is_in_read_transaction());
    assert_eq!(handle.pinned_version(), Some(latest(&handle)));

    handle.close();
    assert!(!handle.is_in_read_transaction());
}

#[test]
fn invalidate_releases_the_pin_and_the_write() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.begin_transaction().unwrap();

    handle.invalidate().unwrap();
    assert!(!handle.is_in_transaction());
    assert_eq!(handle.pinned_version(), None);

    // The lock is free again.
    dir.insert_elsewhere(1);
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn failed_write_closure_cancels() {
    let dir = TestDir::new();
    let handle = dir.open();

    let result: StrataResult<()> = handle.write(|h| {
        h.create_object("object", [("value", Value::Int(1))])?;
        Err(StrataError::internal("abort"))
    });
    assert!(result.is_err());
    assert!(!handle.is_in_transaction());
    assert_eq!(handle.object_count("object").unwrap(), 0);
    handle.close();
}

// ============================================================================
// Usage errors
// ============================================================================

#[test]
fn nested_begin_is_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.begin_transaction().unwrap();

    assert!(matches!(
        handle.begin_transaction(),
        Err(StrataError::InvalidTransaction(_))
    ));
    handle.cancel_transaction().unwrap();
    handle.close();
}

#[test]
fn commit_without_write_is_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();

    let err = handle.commit_transaction().unwrap_err();
    assert!(matches!(err, StrataError::InvalidTransaction(_)));
    assert!(err.to_string().contains("non-existing write transaction"));
    assert!(matches!(
        handle.cancel_transaction(),
        Err(StrataError::InvalidTransaction(_))
    ));
    handle.close();
}

#[test]
fn writes_outside_a_transaction_are_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();

    let err = handle
        .create_object("object", [("value", Value::Int(1))])
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Cannot modify managed objects outside of a write transaction."));
    handle.close();
}

#[test]
fn commit_from_another_thread_is_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.begin_transaction().unwrap();

    let shared = Arc::clone(&handle);
    let result = thread::spawn(move || shared.commit_transaction())
        .join()
        .unwrap();
    assert!(matches!(result, Err(StrataError::IncorrectThread)));

    // The write is still open on the owning thread.
    assert!(handle.is_in_transaction());
    handle.commit_transaction().unwrap();
    handle.close();
}

#[test]
fn compact_inside_a_write_is_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();
    insert(&handle, 1);

    handle.begin_transaction().unwrap();
    assert!(matches!(
        handle.compact(),
        Err(StrataError::InvalidTransaction(_))
    ));
    handle.cancel_transaction().unwrap();

    handle.compact().unwrap();
    assert_eq!(handle.coordinator().store().unwrap().retained_versions(), 1);
    handle.close();
}

#[test]
fn compact_is_rejected_while_other_handles_are_open() {
    let dir = TestDir::new();
    let handle = dir.open();
    insert(&handle, 1);

    let result = dir.on_other_thread(dir.config(), |h| h.compact());
    assert!(matches!(result, Err(StrataError::InvalidTransaction(_))));
    assert!(result.unwrap_err().to_string().contains("other handle"));

    insert(&handle, 2);
    assert_eq!(handle.object_count("object").unwrap(), 2);
    handle.close();
}

#[test]
fn compact_keeps_versions_subscribers_still_need() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();
    assert_eq!(recorded.count(), 1);

    // The commit moves the pin but the callback has not seen it yet.
    insert(&handle, 1);
    handle.compact().unwrap();
    handle.refresh().unwrap();

    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.errors(), 0);
    assert_eq!(recorded.last().unwrap().insertions.len(), 1);

    insert(&handle, 2);
    handle.refresh().unwrap();
    assert_eq!(recorded.count(), 3);
    assert_eq!(recorded.errors(), 0);
    handle.close();
}
