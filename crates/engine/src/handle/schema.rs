//! Schema initialization and updates
//!
//! `update_schema` first plans against the newest snapshot without taking
//! the write lock. Only when the plan needs a write does it take the lock,
//! plan again against what is newest then, and run the schema mode's
//! procedure inside one write transaction. Any failure, including one from
//! a migration or initialization function, rolls the whole write back.

use std::sync::Arc;

use strata_core::{Schema, SchemaChange, StrataError, StrataResult, NOT_VERSIONED};
use strata_storage::{Snapshot, Storage};
use tracing::{debug, info};

use super::Handle;
use crate::config::{InitializationFunction, MigrationFunction, SchemaMode};

/// Writes needed to bring the file to a declared schema
#[derive(Debug)]
struct SchemaWrite {
    /// Schema applied before any function runs
    apply: Option<Schema>,
    schema_version: u64,
    wipe: bool,
    initialize: bool,
    migrate: bool,
    /// Re-check the result against the declared schema after migrating
    verify: bool,
}

#[derive(Debug)]
enum SchemaPlan {
    Unchanged,
    Write(SchemaWrite),
}

fn mismatch(changes: impl IntoIterator<Item = SchemaChange>) -> StrataError {
    StrataError::SchemaMismatch {
        errors: changes.into_iter().map(|c| c.description()).collect(),
    }
}

/// Decide what `mode` has to do to reach `declared` at `version` from `disk`
fn plan(
    mode: SchemaMode,
    disk: &Snapshot,
    declared: &Schema,
    version: u64,
) -> StrataResult<SchemaPlan> {
    let disk_version = disk.version().schema_version;

    if mode.is_read_only() {
        declared.check_additive(disk.schema())?;
        return Ok(SchemaPlan::Unchanged);
    }

    if disk_version == NOT_VERSIONED {
        return Ok(SchemaPlan::Write(SchemaWrite {
            apply: Some(declared.clone()),
            schema_version: version,
            wipe: false,
            initialize: true,
            migrate: false,
            verify: false,
        }));
    }

    let changes = disk.schema().compare(declared);

    if mode == SchemaMode::ResetFile {
        if version != disk_version || changes.iter().any(SchemaChange::requires_migration) {
            return Ok(SchemaPlan::Write(SchemaWrite {
                apply: Some(declared.clone()),
                schema_version: version,
                wipe: true,
                initialize: true,
                migrate: false,
                verify: false,
            }));
        }
        return Ok(if changes.is_empty() {
            SchemaPlan::Unchanged
        } else {
            SchemaPlan::Write(SchemaWrite {
                apply: Some(declared.clone()),
                schema_version: disk_version,
                wipe: false,
                initialize: false,
                migrate: false,
                verify: false,
            })
        });
    }

    if version < disk_version {
        return Err(StrataError::invalid_schema(format!(
            "Provided schema version {} is less than last set version {}.",
            version, disk_version
        )));
    }

    match mode {
        SchemaMode::Automatic if version == disk_version => {
            let errors: Vec<SchemaChange> = changes
                .iter()
                .filter(|c| c.requires_migration())
                .cloned()
                .collect();
            if !errors.is_empty() {
                return Err(mismatch(errors));
            }
            Ok(if changes.is_empty() {
                SchemaPlan::Unchanged
            } else {
                SchemaPlan::Write(SchemaWrite {
                    apply: Some(declared.clone()),
                    schema_version: version,
                    wipe: false,
                    initialize: false,
                    migrate: false,
                    verify: false,
                })
            })
        }
        SchemaMode::Automatic => Ok(SchemaPlan::Write(SchemaWrite {
            apply: Some(declared.clone()),
            schema_version: version,
            wipe: false,
            initialize: false,
            migrate: true,
            verify: false,
        })),
        SchemaMode::Additive => {
            // Removed properties stay in the file.
            let errors: Vec<SchemaChange> = changes
                .iter()
                .filter(|c| !c.is_additive() && !matches!(c, SchemaChange::RemoveProperty { .. }))
                .cloned()
                .collect();
            if !errors.is_empty() {
                return Err(mismatch(errors));
            }
            let grows = changes.iter().any(SchemaChange::is_additive);
            Ok(if grows || version > disk_version {
                SchemaPlan::Write(SchemaWrite {
                    apply: Some(disk.schema().additive_union(declared)),
                    schema_version: version,
                    wipe: false,
                    initialize: false,
                    migrate: false,
                    verify: false,
                })
            } else {
                SchemaPlan::Unchanged
            })
        }
        SchemaMode::Manual if version == disk_version => {
            if changes.is_empty() {
                Ok(SchemaPlan::Unchanged)
            } else {
                Err(mismatch(changes))
            }
        }
        SchemaMode::Manual => Ok(SchemaPlan::Write(SchemaWrite {
            apply: None,
            schema_version: version,
            wipe: false,
            initialize: false,
            migrate: true,
            verify: true,
        })),
        SchemaMode::Immutable | SchemaMode::ReadOnlyAlternative | SchemaMode::ResetFile => {
            Ok(SchemaPlan::Unchanged)
        }
    }
}

/// Report a failing user function as a migration failure
fn migration_error(e: StrataError) -> StrataError {
    match e {
        StrataError::Migration(_) => e,
        other => StrataError::migration(other.to_string()),
    }
}

impl Handle {
    /// Bring the handle to its configured schema, or read the file's schema
    pub(crate) fn initialize(&self) -> StrataResult<()> {
        match &self.config.schema {
            Some(schema) => self.update_schema(
                schema.clone(),
                self.config.schema_version,
                self.config.migration_function.clone(),
                self.config.initialization_function.clone(),
            ),
            None => {
                self.read_group()?;
                Ok(())
            }
        }
    }

    /// Bring the file to `schema` at `version` according to the schema mode
    ///
    /// Read-only modes never write; they only check that the file's schema
    /// is compatible. Other modes write at most once, running `migration`
    /// when the version increases and `initialization` when the file is new.
    pub fn update_schema(
        &self,
        schema: Schema,
        version: u64,
        migration: Option<MigrationFunction>,
        initialization: Option<InitializationFunction>,
    ) -> StrataResult<()> {
        self.check_open()?;
        schema.validate()?;
        if self.state.lock().write.is_some() {
            return Err(StrataError::invalid_transaction(
                "Cannot update the schema inside a write transaction",
            ));
        }
        let mode = self.config.schema_mode;

        let disk = self.storage().latest_snapshot()?;
        match plan(mode, &disk, &schema, version)? {
            SchemaPlan::Unchanged => {
                self.adopt_declared(schema, &disk);
                Ok(())
            }
            SchemaPlan::Write(_) => {
                self.store.write_lock().acquire(self.id);
                let (previous_schema, previous_version) = {
                    let state = self.state.lock();
                    (state.schema.clone(), state.schema_version)
                };
                let result = self.write_schema(mode, schema, version, migration, initialization);
                if result.is_err() {
                    let write = {
                        let mut state = self.state.lock();
                        state.schema = previous_schema;
                        state.schema_version = previous_version;
                        state.pending_suppress.clear();
                        state.write.take()
                    };
                    drop(write);
                    if self.store.write_lock().holder() == Some(self.id) {
                        self.store.write_lock().release(self.id)?;
                    }
                }
                result
            }
        }
    }

    /// Take `schema` as this handle's schema with `disk` unchanged
    fn adopt_declared(&self, schema: Schema, disk: &Arc<Snapshot>) {
        let version = disk.version();
        let mut state = self.state.lock();
        if state.pinned.as_ref().map_or(true, |p| p.version() < version) {
            self.adopt_snapshot(&mut state, disk);
            self.set_pinned(&mut state, Some(Arc::clone(disk)));
        }
        self.coordinator.cache_schema(
            disk.schema(),
            version.schema_version,
            version.transaction_sequence,
        );
        state.schema = schema;
        state.schema_version = version.schema_version;
    }

    /// Run the schema write; the caller holds the write lock and rolls back
    /// on error
    fn write_schema(
        &self,
        mode: SchemaMode,
        schema: Schema,
        version: u64,
        migration: Option<MigrationFunction>,
        initialization: Option<InitializationFunction>,
    ) -> StrataResult<()> {
        let mut txn = self.storage().begin_write()?;
        let disk = self
            .storage()
            .open_snapshot(txn.base_version().transaction_sequence)?;
        let old_version = disk.version().schema_version;

        // Another handle may have updated the file before the lock was ours.
        let write = match plan(mode, &disk, &schema, version)? {
            SchemaPlan::Unchanged => {
                self.store.write_lock().release(self.id)?;
                self.adopt_declared(schema, &disk);
                return Ok(());
            }
            SchemaPlan::Write(write) => write,
        };
        debug!(target: "strata::handle", handle = self.id, ?mode, plan = ?write, "Writing schema");

        if write.wipe {
            txn.clear();
        }
        if let Some(apply) = &write.apply {
            txn.set_schema(apply);
        }
        txn.set_schema_version(write.schema_version);

        {
            let mut state = self.state.lock();
            if state
                .pinned
                .as_ref()
                .map_or(true, |p| p.version() != disk.version())
            {
                self.adopt_snapshot(&mut state, &disk);
                self.set_pinned(&mut state, Some(Arc::clone(&disk)));
            }
            state.write = Some(txn);
            state.schema = schema.clone();
            state.schema_version = write.schema_version;
        }

        if write.initialize {
            if let Some(initialization) = &initialization {
                initialization(self).map_err(migration_error)?;
            }
        }
        if write.migrate {
            if let Some(migration) = &migration {
                migration(old_version, self).map_err(migration_error)?;
            }
        }

        let mut txn = self.state.lock().write.take().ok_or_else(|| {
            StrataError::migration("the write transaction was closed during the migration")
        })?;
        if write.verify {
            let remaining: Vec<SchemaChange> = txn
                .schema()
                .compare(&schema)
                .into_iter()
                .filter(|c| !matches!(c, SchemaChange::ChangeIndex { .. }))
                .collect();
            if !remaining.is_empty() {
                return Err(mismatch(remaining));
            }
            // Index flags are not changed by migrations.
            txn.set_schema(&schema);
        }

        let committed = self.storage().commit(txn)?;
        self.store.write_lock().release(self.id)?;
        let snapshot = self
            .storage()
            .open_snapshot(committed.transaction_sequence)?;
        self.coordinator.cache_schema(
            snapshot.schema(),
            committed.schema_version,
            committed.transaction_sequence,
        );
        {
            let mut state = self.state.lock();
            state.schema_version = committed.schema_version;
            self.set_pinned(&mut state, Some(snapshot));
        }
        self.coordinator.signal_commit();
        info!(
            target: "strata::handle",
            handle = self.id,
            schema_version = committed.schema_version,
            version = committed.transaction_sequence,
            "Schema updated"
        );

        if let Some(binding) = self.binding() {
            binding.schema_did_change(self, &schema);
        }
        Ok(())
    }

    /// Schema and schema version as of transaction `transaction_sequence`
    ///
    /// A read-only look at history: neither the pin nor the schema cache
    /// changes.
    pub fn schema_at_version(&self, transaction_sequence: u64) -> StrataResult<(Schema, u64)> {
        self.check_open()?;
        let snapshot = self.storage().open_snapshot(transaction_sequence)?;
        Ok((
            self.storage().read_schema(&snapshot),
            snapshot.version().schema_version,
        ))
    }
}
