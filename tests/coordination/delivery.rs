//! Notification Delivery Tests
//!
//! - First delivery reports the initial state
//! - Commits from any handle reach every subscriber
//! - Commits between deliveries coalesce into one net change set
//! - suppress_next leaves one commit out for one callback
//! - Notifier errors are delivered once
//! - Tokens added or removed during a round take effect at round boundaries

use crate::common::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use stratalive::Predicate;

fn positions(items: &[usize]) -> BTreeSet<usize> {
    items.iter().copied().collect()
}

// ============================================================================
// Initial and incremental results
// ============================================================================

#[test]
fn first_delivery_is_the_initial_state() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);

    assert_eq!(recorded.count(), 0);
    handle.refresh().unwrap();

    assert_eq!(recorded.count(), 1);
    assert!(recorded.last().unwrap().is_empty());
    handle.close();
}

#[test]
fn local_commit_is_delivered_on_refresh() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);
    handle.refresh().unwrap();

    insert(&handle, 5);
    handle.refresh().unwrap();

    assert_eq!(recorded.count(), 2);
    let changes = recorded.last().unwrap();
    assert_eq!(changes.insertions, positions(&[0]));
    assert!(changes.deletions.is_empty());
    assert_eq!(results.len().unwrap(), 1);
    assert_eq!(results.value(0, "value").unwrap(), Some(Value::Int(5)));
    handle.close();
}

#[test]
fn commit_on_another_thread_is_delivered() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);
    handle.refresh().unwrap();

    dir.insert_elsewhere(1);
    assert!(handle.refresh().unwrap());

    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.last().unwrap().insertions, positions(&[0]));
    assert_eq!(handle.pinned_version(), Some(latest(&handle)));
    handle.close();
}

#[test]
fn several_commits_coalesce_into_one_delivery() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);
    handle.refresh().unwrap();

    for value in 0..3 {
        dir.insert_elsewhere(value);
    }
    handle.refresh().unwrap();

    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.last().unwrap().insertions, positions(&[0, 1, 2]));
    handle.close();
}

#[test]
fn net_zero_commits_deliver_nothing() {
    let dir = TestDir::new();
    let handle = dir.open();
    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);
    handle.refresh().unwrap();

    dir.on_other_thread(dir.config(), |h| {
        let key = h
            .write(|h| h.create_object("object", [("value", Value::Int(9))]))
            .unwrap();
        h.write(|h| h.delete_object("object", key)).unwrap();
    });
    assert!(handle.refresh().unwrap());

    assert_eq!(recorded.count(), 1);
    assert!(results.is_empty().unwrap());
    handle.close();
}

#[test]
fn modification_reports_the_changed_row() {
    let dir = TestDir::new();
    let handle = dir.open();
    let key = handle
        .write(|h| h.create_object("object", [("value", Value::Int(1))]))
        .unwrap();
    insert(&handle, 2);

    let results = handle.objects("object");
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&results);
    handle.refresh().unwrap();

    handle
        .write(|h| h.set_value("object", key, "value", Value::Int(10)))
        .unwrap();
    handle.refresh().unwrap();

    let changes = recorded.last().unwrap();
    assert_eq!(changes.modifications, positions(&[0]));
    assert!(changes.insertions.is_empty());
    handle.close();
}

#[test]
fn filtered_results_ignore_unrelated_commits() {
    let dir = TestDir::new();
    let handle = dir.open();
    let large = handle
        .objects("object")
        .filter(Predicate::gt("value", Value::Int(100)));
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&large);
    handle.refresh().unwrap();

    insert(&handle, 1);
    handle.refresh().unwrap();
    assert_eq!(recorded.count(), 1);

    insert(&handle, 500);
    handle.refresh().unwrap();
    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.last().unwrap().insertions, positions(&[0]));
    handle.close();
}

#[test]
fn callbacks_on_the_same_query_share_a_notifier() {
    let dir = TestDir::new();
    let handle = dir.open();
    let first = Recorded::new();
    let second = Recorded::new();
    let _a = first.subscribe(&handle.objects("object"));
    let _b = second.subscribe(&handle.objects("object"));

    assert_eq!(handle.coordinator().notifier_count(), 1);
    handle.refresh().unwrap();
    insert(&handle, 1);
    handle.refresh().unwrap();

    assert_eq!(first.count(), 2);
    assert_eq!(second.count(), 2);
    handle.close();
}

#[test]
fn late_callback_starts_from_the_current_results() {
    let dir = TestDir::new();
    let handle = dir.open();
    let early = Recorded::new();
    let _early = early.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();
    insert(&handle, 1);
    handle.refresh().unwrap();

    let late = Recorded::new();
    let _late = late.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();

    assert_eq!(late.count(), 1);
    assert!(late.last().unwrap().is_empty());
    assert_eq!(early.count(), 2);
    handle.close();
}

// ============================================================================
// Unregistering
// ============================================================================

#[test]
fn dropped_token_stops_deliveries() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let token = recorded.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();

    drop(token);
    assert_eq!(handle.coordinator().notifier_count(), 0);
    insert(&handle, 1);
    handle.refresh().unwrap();

    assert_eq!(recorded.count(), 1);
    handle.close();
}

#[test]
fn unregister_is_idempotent() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let mut token = recorded.subscribe(&handle.objects("object"));

    token.unregister();
    token.unregister();
    assert!(token.is_empty());
    assert!(NotificationToken::default().is_empty());
    handle.close();
}

// ============================================================================
// suppress_next
// ============================================================================

#[test]
fn suppress_next_outside_write_fails() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let token = recorded.subscribe(&handle.objects("object"));

    let err = token.suppress_next().unwrap_err();
    assert!(matches!(err, StrataError::InvalidTransaction(_)));
    assert!(err.to_string().contains("inside the write transaction"));
    handle.close();
}

#[test]
fn suppress_next_from_another_thread_fails() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let token = recorded.subscribe(&handle.objects("object"));

    handle.begin_transaction().unwrap();
    let result = thread::scope(|s| s.spawn(|| token.suppress_next()).join().unwrap());
    assert!(matches!(result, Err(StrataError::IncorrectThread)));
    handle.cancel_transaction().unwrap();
    handle.close();
}

#[test]
fn suppressed_commit_is_skipped_for_that_callback_only() {
    let dir = TestDir::new();
    let handle = dir.open();
    let quiet = Recorded::new();
    let loud = Recorded::new();
    let quiet_token = quiet.subscribe(&handle.objects("object"));
    let _loud_token = loud.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();

    handle.begin_transaction().unwrap();
    handle
        .create_object("object", [("value", Value::Int(1))])
        .unwrap();
    quiet_token.suppress_next().unwrap();
    handle.commit_transaction().unwrap();
    handle.refresh().unwrap();

    assert_eq!(quiet.count(), 1);
    assert_eq!(loud.count(), 2);

    insert(&handle, 2);
    handle.refresh().unwrap();
    assert_eq!(quiet.count(), 2);
    assert_eq!(quiet.last().unwrap().insertions, positions(&[1]));
    handle.close();
}

#[test]
fn cancelled_write_drops_the_suppression() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let token = recorded.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();

    handle.begin_transaction().unwrap();
    token.suppress_next().unwrap();
    handle.cancel_transaction().unwrap();

    insert(&handle, 1);
    handle.refresh().unwrap();
    assert_eq!(recorded.count(), 2);
    handle.close();
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn notifier_error_is_delivered_once() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&handle.objects("object"));
    handle.refresh().unwrap();

    let store = handle.coordinator().store().unwrap();
    dir.insert_elsewhere(1);
    store.set_fail_snapshot_opens(true);
    handle.coordinator().on_change();
    store.set_fail_snapshot_opens(false);

    handle.notify();
    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.errors(), 1);

    dir.insert_elsewhere(2);
    handle.coordinator().on_change();
    handle.notify();
    assert_eq!(recorded.count(), 2);

    // The handle itself keeps working.
    assert_eq!(handle.object_count("object").unwrap(), 2);
    handle.close();
}

#[test]
fn callback_added_after_an_error_gets_its_own_copy_later() {
    let dir = TestDir::new();
    let handle = dir.open();
    let late = Recorded::new();
    let late_token = Arc::new(Mutex::new(None));
    let weak = Arc::downgrade(&handle);
    let slot = Arc::clone(&late_token);
    let subscriber = late.clone();
    let first_errors = Arc::new(Mutex::new(0usize));
    let seen = Arc::clone(&first_errors);
    let _first = handle
        .objects("object")
        .add_notification_callback(move |_, error| {
            if error.is_none() {
                return;
            }
            *seen.lock() += 1;
            if let Some(h) = weak.upgrade() {
                *slot.lock() = Some(subscriber.subscribe(&h.objects("object")));
            }
        })
        .unwrap();
    handle.refresh().unwrap();

    let store = handle.coordinator().store().unwrap();
    dir.insert_elsewhere(1);
    store.set_fail_snapshot_opens(true);
    handle.coordinator().on_change();
    store.set_fail_snapshot_opens(false);

    handle.notify();
    assert_eq!(*first_errors.lock(), 1);
    assert!(late_token.lock().is_some());
    assert_eq!(late.count(), 0);

    handle.notify();
    assert_eq!(late.count(), 1);
    assert_eq!(late.errors(), 1);
    assert_eq!(*first_errors.lock(), 1);

    late_token.lock().take();
    handle.close();
}

// ============================================================================
// Token changes during a round
// ============================================================================

#[test]
fn callback_added_during_a_round_waits_for_the_next() {
    let dir = TestDir::new();
    let handle = dir.open();
    let added = Recorded::new();
    let added_token = Arc::new(Mutex::new(None));
    let weak = Arc::downgrade(&handle);
    let slot = Arc::clone(&added_token);
    let subscriber = added.clone();
    let _adder = handle
        .objects("object")
        .add_notification_callback(move |_, _| {
            let mut slot = slot.lock();
            if slot.is_none() {
                if let Some(h) = weak.upgrade() {
                    let sorted = h.objects("object").sorted_by("value", false);
                    *slot = Some(subscriber.subscribe(&sorted));
                }
            }
        })
        .unwrap();

    handle.refresh().unwrap();
    assert!(added_token.lock().is_some());
    assert_eq!(added.count(), 0);

    handle.refresh().unwrap();
    assert_eq!(added.count(), 1);
    assert!(added.last().unwrap().is_empty());

    added_token.lock().take();
    handle.close();
}

#[test]
fn callback_removed_during_a_round_is_skipped() {
    let dir = TestDir::new();
    let handle = dir.open();
    let removed_slot: Arc<Mutex<Option<NotificationToken>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&removed_slot);
    let _remover = handle
        .objects("object")
        .add_notification_callback(move |_, _| {
            slot.lock().take();
        })
        .unwrap();
    let removed = Recorded::new();
    *removed_slot.lock() = Some(removed.subscribe(
        &handle.objects("object").sorted_by("value", true),
    ));
    let kept = Recorded::new();
    let _kept = kept.subscribe(
        &handle
            .objects("object")
            .filter(Predicate::gt("value", Value::Int(0))),
    );

    handle.refresh().unwrap();
    assert!(removed_slot.lock().is_none());
    assert_eq!(removed.count(), 0);
    assert_eq!(kept.count(), 1);

    insert(&handle, 1);
    handle.refresh().unwrap();
    assert_eq!(removed.count(), 0);
    assert_eq!(kept.count(), 2);
    handle.close();
}

// ============================================================================
// Visibility across handles
// ============================================================================

#[test]
fn pinned_version_never_moves_backwards() {
    let dir = TestDir::new();
    let handle = dir.open();
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&handle.objects("object"));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let config = dir.config();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let writer = Handle::open(config).unwrap();
            for value in 0..30 {
                insert(&writer, value);
            }
            writer.close();
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut seen = Vec::new();
    while !done.load(Ordering::SeqCst) {
        handle.refresh().unwrap();
        seen.extend(handle.pinned_version());
    }
    writer.join().unwrap();
    handle.refresh().unwrap();
    seen.extend(handle.pinned_version());

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "pins went backwards: {:?}", seen);
    assert_eq!(seen.last().copied(), Some(latest(&handle)));
    assert_eq!(handle.object_count("object").unwrap(), 30);
    handle.close();
}

#[test]
fn filtered_results_follow_passes_and_notify() {
    let dir = TestDir::new();
    dir.insert_elsewhere(-1);
    let handle = dir.open_uncached();
    let positive = handle
        .objects("object")
        .filter(Predicate::gt("value", Value::Int(0)));
    let recorded = Recorded::new();
    let _token = recorded.subscribe(&positive);

    handle.coordinator().on_change();
    handle.notify();
    assert_eq!(recorded.count(), 1);
    assert!(recorded.last().unwrap().is_empty());

    dir.insert_elsewhere(5);
    handle.coordinator().on_change();
    handle.notify();

    assert_eq!(recorded.count(), 2);
    assert_eq!(recorded.last().unwrap().insertions, positions(&[0]));
    assert_eq!(positive.len().unwrap(), 1);
    assert_eq!(handle.object_count("object").unwrap(), 2);
    handle.close();
}
