//! Error types for Strata Live
//!
//! All fallible operations return [`StrataResult`]. Usage and configuration
//! errors fail fast at the call site; notifier failures never surface here and
//! are delivered through [`NotifierError`] instead.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Strata operations
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Error types for the coordination layer
#[derive(Debug, Error)]
pub enum StrataError {
    // ========================================================================
    // Usage errors
    // ========================================================================
    /// Operation attempted on a handle that has been closed
    #[error("Cannot access handle that has been closed")]
    ClosedHandle,

    /// Commit, cancel or write attempted without a suitable transaction
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Handle accessed from a thread other than the one it is bound to
    #[error("Handle accessed from incorrect thread")]
    IncorrectThread,

    // ========================================================================
    // Configuration errors
    // ========================================================================
    /// Configuration is invalid on its own
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration disagrees with a handle already open on the same path
    #[error("Mismatched configuration: {0}")]
    MismatchedConfig(String),

    /// Schema definition is invalid
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    // ========================================================================
    // Schema compatibility and migration
    // ========================================================================
    /// On-disk schema diverges incompatibly from the expected schema
    #[error("Schema mismatch:\n- {}", errors.join("\n- "))]
    SchemaMismatch {
        /// One message per incompatibility
        errors: Vec<String>,
    },

    /// Migration or initialization function failed; the write was rolled back
    #[error("Migration failed: {0}")]
    Migration(String),

    // ========================================================================
    // Infrastructure
    // ========================================================================
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The cross-handle wake channel could not be established
    #[error("Wake channel error: {0}")]
    WakeChannel(String),

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        StrataError::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        StrataError::Internal(msg.into())
    }

    /// Create an invalid transaction error
    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        StrataError::InvalidTransaction(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        StrataError::InvalidConfig(msg.into())
    }

    /// Create a mismatched configuration error
    pub fn mismatched_config(msg: impl Into<String>) -> Self {
        StrataError::MismatchedConfig(msg.into())
    }

    /// Create an invalid schema error
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        StrataError::InvalidSchema(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        StrataError::Migration(msg.into())
    }

    /// Whether the caller is expected to fix its own usage
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            StrataError::ClosedHandle
                | StrataError::InvalidTransaction(_)
                | StrataError::IncorrectThread
        )
    }
}

/// Error delivered asynchronously to notification callbacks
///
/// Cloned once per subscriber; the message is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierError {
    message: Arc<str>,
}

impl NotifierError {
    /// Create a notifier error with the given message
    pub fn new(message: impl AsRef<str>) -> Self {
        NotifierError {
            message: Arc::from(message.as_ref()),
        }
    }

    /// The error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for NotifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notifier error: {}", self.message)
    }
}

impl std::error::Error for NotifierError {}

impl From<&StrataError> for NotifierError {
    fn from(e: &StrataError) -> Self {
        NotifierError::new(e.to_string())
    }
}
