//! Schema Mode Tests
//!
//! - Initialization and migration functions, with rollback on failure
//! - Automatic, Additive, Manual, ResetFile and Immutable behavior
//! - External schema changes seen on refresh
//! - Dynamic handles following the file's schema

use crate::common::*;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use stratalive::{MigrationFunction, Storage};

fn config_for(dir: &TestDir, schema: Schema, version: u64, mode: SchemaMode) -> Config {
    let mut config = dir.config().with_schema(schema, version);
    config.schema_mode = mode;
    config
}

fn value() -> Property {
    Property::new("value", PropertyType::Int)
}

fn label() -> Property {
    Property::new("label", PropertyType::String)
}

/// Create the file with `schema()` at version 0 holding `values`
fn seed(dir: &TestDir, values: &[i64]) {
    let handle = dir.open();
    for v in values {
        insert(&handle, *v);
    }
    handle.close();
}

/// Schema stored in the newest snapshot of the file
fn disk_schema(handle: &Handle) -> Schema {
    let store = handle.coordinator().store().unwrap();
    store.latest_snapshot().unwrap().schema().clone()
}

fn has_property(schema: &Schema, name: &str) -> bool {
    schema
        .find("object")
        .and_then(|o| o.property(name))
        .is_some()
}

// ============================================================================
// Initialization
// ============================================================================

#[test]
fn initialization_runs_once_for_a_new_file() {
    let dir = TestDir::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let counter = Arc::clone(&calls);
        let mut config = dir.config();
        config.initialization_function = Some(Arc::new(move |h: &Handle| -> StrataResult<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            h.create_object("object", [("value", Value::Int(1))])?;
            Ok(())
        }));
        let handle = Handle::open(config).unwrap();
        assert_eq!(handle.object_count("object").unwrap(), 1);
        handle.close();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_initialization_leaves_the_file_uninitialized() {
    let dir = TestDir::new();
    let mut config = dir.config();
    config.initialization_function = Some(Arc::new(|h: &Handle| -> StrataResult<()> {
        h.create_object("object", [("value", Value::Int(1))])?;
        Err(StrataError::internal("init failed"))
    }));

    let err = Handle::open(config).unwrap_err();
    assert!(matches!(err, StrataError::Migration(_)));

    let handle = dir.open();
    assert_eq!(handle.object_count("object").unwrap(), 0);
    assert_eq!(handle.schema_version(), 0);
    handle.close();
}

// ============================================================================
// Migrations
// ============================================================================

fn doubling_migration(old_versions: Arc<AtomicU64>, fail: bool) -> MigrationFunction {
    Arc::new(move |old: u64, h: &Handle| -> StrataResult<()> {
        old_versions.store(old, Ordering::SeqCst);
        for key in h.keys("object")? {
            let value = h
                .get_value("object", key, "value")?
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            h.set_value("object", key, "doubled", Value::Int(value * 2))?;
        }
        if fail {
            return Err(StrataError::internal("migration failed"));
        }
        Ok(())
    })
}

fn doubled_schema() -> Schema {
    schema_with(vec![value(), Property::new("doubled", PropertyType::Int)])
}

#[test]
fn failed_migration_rolls_back_and_can_be_retried() {
    let dir = TestDir::new();
    seed(&dir, &[1, 2]);
    let old = Arc::new(AtomicU64::new(u64::MAX));

    let mut config = config_for(&dir, doubled_schema(), 1, SchemaMode::Automatic);
    config.migration_function = Some(doubling_migration(Arc::clone(&old), true));
    let err = Handle::open(config).unwrap_err();
    assert!(matches!(err, StrataError::Migration(_)));
    assert!(err.to_string().contains("migration failed"));

    let unchanged = dir.open();
    assert_eq!(unchanged.schema_version(), 0);
    assert!(!has_property(&disk_schema(&unchanged), "doubled"));
    unchanged.close();

    let mut config = config_for(&dir, doubled_schema(), 1, SchemaMode::Automatic);
    config.migration_function = Some(doubling_migration(Arc::clone(&old), false));
    let handle = Handle::open(config).unwrap();

    assert_eq!(old.load(Ordering::SeqCst), 0);
    assert_eq!(handle.schema_version(), 1);
    let keys = handle.keys("object").unwrap();
    let doubled: Vec<_> = keys
        .iter()
        .map(|k| handle.get_value("object", *k, "doubled").unwrap())
        .collect();
    assert_eq!(doubled, vec![Some(Value::Int(2)), Some(Value::Int(4))]);
    handle.close();
}

#[test]
fn lower_schema_version_is_rejected() {
    let dir = TestDir::new();
    seed(&dir, &[]);
    let handle = Handle::open(config_for(&dir, schema(), 3, SchemaMode::Automatic)).unwrap();
    handle.close();

    let err = Handle::open(config_for(&dir, schema(), 2, SchemaMode::Automatic)).unwrap_err();
    assert!(matches!(err, StrataError::InvalidSchema(_)));
    assert!(err
        .to_string()
        .contains("Provided schema version 2 is less than last set version 3."));
}

#[test]
fn automatic_mode_needs_a_version_bump_for_new_properties() {
    let dir = TestDir::new();
    seed(&dir, &[1]);

    let err = Handle::open(config_for(
        &dir,
        schema_with(vec![value(), label()]),
        0,
        SchemaMode::Automatic,
    ))
    .unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
    assert!(err.to_string().contains("Property 'object.label' has been added."));

    let handle = Handle::open(config_for(
        &dir,
        schema_with(vec![value(), label()]),
        1,
        SchemaMode::Automatic,
    ))
    .unwrap();
    assert!(has_property(&disk_schema(&handle), "label"));
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn automatic_mode_adds_new_types_in_place() {
    let dir = TestDir::new();
    seed(&dir, &[]);
    let extended = Schema::new(vec![
        ObjectSchema::new("object", vec![value()]),
        ObjectSchema::new("other", vec![value()]),
    ]);

    let handle = Handle::open(config_for(&dir, extended, 0, SchemaMode::Automatic)).unwrap();
    assert_eq!(handle.schema_version(), 0);
    assert!(disk_schema(&handle).find("other").is_some());
    handle.close();
}

#[test]
fn update_schema_on_an_open_handle() {
    let dir = TestDir::new();
    let handle = dir.open();
    insert(&handle, 1);

    handle
        .update_schema(schema_with(vec![value(), label()]), 1, None, None)
        .unwrap();

    assert_eq!(handle.schema_version(), 1);
    assert!(has_property(&handle.schema(), "label"));
    assert!(has_property(&disk_schema(&handle), "label"));
    handle.close();
}

#[test]
fn update_schema_inside_a_write_is_rejected() {
    let dir = TestDir::new();
    let handle = dir.open();
    handle.begin_transaction().unwrap();

    assert!(matches!(
        handle.update_schema(schema(), 1, None, None),
        Err(StrataError::InvalidTransaction(_))
    ));
    handle.cancel_transaction().unwrap();
    handle.close();
}

#[test]
fn schema_at_version_reads_history() {
    let dir = TestDir::new();
    let handle = dir.open();
    let before = latest(&handle);

    handle
        .update_schema(schema_with(vec![value(), label()]), 1, None, None)
        .unwrap();

    let (old_schema, old_version) = handle.schema_at_version(before).unwrap();
    assert_eq!(old_version, 0);
    assert!(!has_property(&old_schema, "label"));

    let (new_schema, new_version) = handle.schema_at_version(latest(&handle)).unwrap();
    assert_eq!(new_version, 1);
    assert!(has_property(&new_schema, "label"));
    handle.close();
}

// ============================================================================
// Additive
// ============================================================================

#[test]
fn additive_mode_keeps_removed_columns() {
    let dir = TestDir::new();
    {
        let handle = Handle::open(config_for(
            &dir,
            schema_with(vec![value(), Property::new("extra", PropertyType::String)]),
            0,
            SchemaMode::Additive,
        ))
        .unwrap();
        insert(&handle, 1);
        handle.close();
    }

    let handle = Handle::open(config_for(
        &dir,
        schema_with(vec![value(), label()]),
        0,
        SchemaMode::Additive,
    ))
    .unwrap();

    let disk = disk_schema(&handle);
    assert!(has_property(&disk, "extra"));
    assert!(has_property(&disk, "label"));
    assert!(!has_property(&handle.schema(), "extra"));
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn additive_mode_rejects_type_changes() {
    let dir = TestDir::new();
    seed(&dir, &[]);

    let err = Handle::open(config_for(
        &dir,
        schema_with(vec![Property::new("value", PropertyType::String)]),
        0,
        SchemaMode::Additive,
    ))
    .unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
}

// ============================================================================
// Manual
// ============================================================================

#[test]
fn manual_mode_migration_must_apply_the_changes() {
    let dir = TestDir::new();
    seed(&dir, &[1]);
    let target = schema_with(vec![value(), label()]);

    let mut config = config_for(&dir, target.clone(), 1, SchemaMode::Manual);
    config.migration_function = Some(Arc::new(|_: u64, _: &Handle| -> StrataResult<()> { Ok(()) }));
    let err = Handle::open(config).unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));

    let mut config = config_for(&dir, target, 1, SchemaMode::Manual);
    config.migration_function = Some(Arc::new(|_: u64, h: &Handle| -> StrataResult<()> {
        h.add_property("object", label())
    }));
    let handle = Handle::open(config).unwrap();
    assert_eq!(handle.schema_version(), 1);
    assert!(has_property(&disk_schema(&handle), "label"));
    assert_eq!(handle.object_count("object").unwrap(), 1);
    handle.close();
}

#[test]
fn manual_mode_rejects_changes_without_a_version_bump() {
    let dir = TestDir::new();
    seed(&dir, &[]);

    let err = Handle::open(config_for(
        &dir,
        schema_with(vec![value(), label()]),
        0,
        SchemaMode::Manual,
    ))
    .unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
}

// ============================================================================
// ResetFile
// ============================================================================

#[test]
fn reset_file_wipes_on_version_change() {
    let dir = TestDir::new();
    seed(&dir, &[1, 2, 3]);
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);

    let mut config = config_for(
        &dir,
        schema_with(vec![value(), label()]),
        1,
        SchemaMode::ResetFile,
    );
    config.initialization_function = Some(Arc::new(move |_: &Handle| -> StrataResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let handle = Handle::open(config).unwrap();

    assert_eq!(handle.object_count("object").unwrap(), 0);
    assert_eq!(handle.schema_version(), 1);
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    handle.close();
}

#[test]
fn reset_file_keeps_data_when_nothing_changed() {
    let dir = TestDir::new();
    seed(&dir, &[1, 2]);

    let handle = Handle::open(config_for(&dir, schema(), 0, SchemaMode::ResetFile)).unwrap();
    assert_eq!(handle.object_count("object").unwrap(), 2);
    handle.close();
}

// ============================================================================
// Immutable
// ============================================================================

#[test]
fn immutable_mode_rejects_missing_columns() {
    let dir = TestDir::new();
    seed(&dir, &[]);

    let err = Handle::open(config_for(
        &dir,
        schema_with(vec![value(), label()]),
        0,
        SchemaMode::Immutable,
    ))
    .unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
}

#[test]
fn immutable_mode_accepts_a_subset_and_never_writes() {
    let dir = TestDir::new();
    {
        let handle = Handle::open(config_for(
            &dir,
            schema_with(vec![value(), label()]),
            0,
            SchemaMode::Automatic,
        ))
        .unwrap();
        handle.close();
    }

    let handle = Handle::open(config_for(&dir, schema(), 0, SchemaMode::Immutable)).unwrap();
    let before = latest(&handle);
    assert!(!has_property(&handle.schema(), "label"));
    assert!(has_property(&disk_schema(&handle), "label"));
    assert_eq!(latest(&handle), before);
    handle.close();
}

// ============================================================================
// External schema changes
// ============================================================================

#[test]
fn removed_property_fails_refresh() {
    let dir = TestDir::new();
    let handle = dir.open();

    dir.on_other_thread(dir.dynamic_config(), |h| {
        h.write(|h| h.remove_property("object", "value")).unwrap();
    });

    let err = handle.refresh().unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
    assert!(err
        .to_string()
        .contains("Property 'object.value' has been removed."));
    handle.close();
}

#[test]
fn changed_property_type_fails_begin_transaction() {
    let dir = TestDir::new();
    let handle = dir.open();

    dir.on_other_thread(dir.dynamic_config(), |h| {
        h.write(|h| {
            h.remove_property("object", "value")?;
            h.add_property("object", Property::new("value", PropertyType::Float))
        })
        .unwrap();
    });

    let err = handle.begin_transaction().unwrap_err();
    assert!(matches!(err, StrataError::SchemaMismatch { .. }));
    assert!(err.to_string().contains("from 'int' to 'float'"));
    assert!(!handle.is_in_transaction());

    // The write lock was released.
    dir.on_other_thread(dir.dynamic_config(), |h| {
        h.write(|h| h.create_object("object", [("value", Value::Float(1.5))]))
            .unwrap();
    });
    handle.close();
}

#[test]
fn dynamic_handle_follows_schema_changes() {
    let dir = TestDir::new();
    seed(&dir, &[]);
    let handle = Handle::open(dir.dynamic_config()).unwrap();
    assert!(handle.is_dynamic());
    let hooks = Hooks::new();
    handle.set_binding_context(hooks.clone());

    dir.on_other_thread(dir.config(), |h| {
        h.write(|h| h.add_object_type(ObjectSchema::new("other", vec![value()])))
            .unwrap();
    });
    handle.refresh().unwrap();

    assert_eq!(hooks.count("schema_did_change"), 1);
    assert!(handle.schema().find("other").is_some());
    handle.close();
}

// ============================================================================
// Schema cache
// ============================================================================

#[test]
fn schema_cache_advances_with_commits() {
    let dir = TestDir::new();
    let handle = dir.open();
    let coordinator = Arc::clone(handle.coordinator());

    let (cached, version, at) = coordinator.get_cached_schema().unwrap();
    assert_eq!(cached, disk_schema(&handle));
    assert_eq!(version, 0);
    assert_eq!(at, latest(&handle));

    insert(&handle, 1);
    let (_, _, at) = coordinator.get_cached_schema().unwrap();
    assert_eq!(at, latest(&handle));
    handle.close();
}
