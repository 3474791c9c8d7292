//! Core types for Strata Live
//!
//! This crate defines the foundational types shared by storage and the engine:
//! - StrataError / StrataResult: error taxonomy
//! - NotifierError: asynchronous error delivered to notification callbacks
//! - VersionClock: ordered `(schema_version, transaction_sequence)` pair
//! - Value: scalar property value
//! - Schema: object schemas, validation and comparison
//! - Query: filter/sort shape of a subscribed collection
//! - ChangeSet: net difference between two versions of a query's results

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changeset;
pub mod error;
pub mod query;
pub mod schema;
pub mod value;
pub mod version;

pub use changeset::{ChangeSet, Move};
pub use error::{NotifierError, StrataError, StrataResult};
pub use query::{CompareOp, Predicate, Query, SortDescriptor};
pub use schema::{ObjectSchema, Property, PropertyType, Schema, SchemaChange};
pub use value::Value;
pub use version::{VersionClock, NOT_VERSIONED};
