//! Coordination engine for Strata Live
//!
//! This crate ties handles on the same database file together:
//! - Coordinator: one per canonical path; owns storage, write lock, schema
//!   cache, notifier pool and wake channel
//! - Handle: one thread's pinned view of the file, with write transactions
//!   and notification delivery
//! - Notifier: per-query change-set computation on background threads
//! - Results / NotificationToken: live query results and their callbacks
//! - BindingContext / Scheduler: hooks into the embedding application
//!
//! Handles never share mutable state directly. Commits signal the
//! coordinator, a pass computes change sets for every notifier, and each
//! handle delivers its own results on its own thread.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod binding;
pub mod config;
pub mod coordinator;
pub mod handle;
pub mod notifier;
pub mod registry;
pub mod results;
pub mod schema_cache;
pub mod token;
pub mod wake;

pub use background::{NotifierPool, PoolShutdown, PoolStats};
pub use binding::{BindingContext, Scheduler};
pub use config::{
    Config, ExecutionContextId, HandleOptions, InitializationFunction, MigrationFunction,
    SchemaMode, ShouldCompactFunction, ENCRYPTION_KEY_LEN,
};
pub use coordinator::{assert_no_open_handles, Coordinator};
pub use handle::{Handle, SharedHandle};
pub use notifier::{Callback, Notifier};
pub use registry::canonical_path;
pub use results::Results;
pub use schema_cache::{SchemaCache, SchemaCacheEntry};
pub use token::NotificationToken;
pub use wake::ExternalWake;
