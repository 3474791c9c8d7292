//! Strata Live - multi-version coordination for embedded object databases
//!
//! Many threads open the same database file through per-thread [`Handle`]s.
//! Each handle reads a pinned snapshot, writes through an exclusive write
//! transaction, and receives change sets for the queries it subscribed to.
//! One [`Coordinator`] per file ties the handles together.
//!
//! # Quick Start
//!
//! ```ignore
//! use stratalive::{Config, Handle, ObjectSchema, Property, PropertyType, Schema, Value};
//!
//! let schema = Schema::new(vec![ObjectSchema::new(
//!     "object",
//!     vec![Property::new("value", PropertyType::Int)],
//! )]);
//! let handle = Handle::open(Config::new("app.db").with_schema(schema, 0))?;
//!
//! let results = handle.objects("object");
//! let _token = results.add_notification_callback(|changes, _| {
//!     println!("inserted: {:?}", changes.insertions);
//! })?;
//!
//! handle.write(|h| h.create_object("object", [("value", Value::Int(1))]))?;
//! handle.refresh()?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: errors, versions, schema model, queries and change sets
//! - `strata-storage`: the versioned snapshot store handles read and write
//! - `strata-engine`: coordinators, handles, notifiers and delivery

pub use strata_core::{
    ChangeSet, CompareOp, Move, NotifierError, ObjectSchema, Predicate, Property, PropertyType,
    Query, Schema, SchemaChange, SortDescriptor, StrataError, StrataResult, Value, VersionClock,
    NOT_VERSIONED,
};
pub use strata_engine::{
    assert_no_open_handles, canonical_path, BindingContext, Config, Coordinator,
    ExecutionContextId, HandleOptions, Handle, InitializationFunction, MigrationFunction,
    NotificationToken, Results, SchemaMode, Scheduler, SharedHandle, ShouldCompactFunction,
    ENCRYPTION_KEY_LEN,
};
pub use strata_storage::{RowKey, Snapshot, Storage, VersionedStore};
