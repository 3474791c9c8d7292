//! Handle configuration
//!
//! [`Config`] is built programmatically by the embedding application and
//! describes one open of a database file: its path, the schema the caller
//! expects, how schema differences are resolved, and whether the handle is
//! cached. Runtime knobs that make sense to keep in a file live in
//! [`HandleOptions`], which can be loaded from TOML.
//!
//! # Example
//!
//! ```toml
//! # Run a notifier pass automatically after every commit
//! automatic_change_notifications = true
//!
//! # Advance handles to the newest ready version on notify()
//! auto_refresh = true
//!
//! # Worker threads computing change sets (0 = compute inline)
//! notifier_threads = 2
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::{Schema, StrataError, StrataResult, NOT_VERSIONED};

use crate::handle::Handle;

/// Required length of an encryption key in bytes
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// How differences between the declared and the on-disk schema are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Additive changes apply in place; anything else needs a version bump
    #[default]
    Automatic,
    /// Only additive changes are allowed; removed properties stay on disk
    Additive,
    /// Every change needs a version bump and is applied by the migration
    Manual,
    /// Incompatible files are wiped and recreated
    ResetFile,
    /// Never write; the declared schema must be a subset of the file
    Immutable,
    /// Like `Immutable`, for read-only alternative copies of a file
    ReadOnlyAlternative,
}

impl SchemaMode {
    /// Whether handles in this mode never write schema changes
    pub fn is_read_only(self) -> bool {
        matches!(self, SchemaMode::Immutable | SchemaMode::ReadOnlyAlternative)
    }
}

/// Explicit execution context a handle is bound to instead of its thread
///
/// Handles opened with the same context share cached instances and may be
/// used from any thread that runs that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContextId(pub u64);

/// Called inside the schema-update write when the schema version increases
///
/// Receives the schema version the file had before the update and the
/// handle whose write transaction is open.
pub type MigrationFunction = Arc<dyn Fn(u64, &Handle) -> StrataResult<()> + Send + Sync>;

/// Called inside the schema-update write when the file was uninitialized
pub type InitializationFunction = Arc<dyn Fn(&Handle) -> StrataResult<()> + Send + Sync>;

/// Decides whether to compact on first open: `(total_bytes, used_bytes)`
pub type ShouldCompactFunction = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

// ============================================================================
// HandleOptions
// ============================================================================

/// Runtime behavior knobs, loadable from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleOptions {
    /// Run a notifier pass from a background thread after every commit
    #[serde(default = "default_true")]
    pub automatic_change_notifications: bool,
    /// Whether `notify()` advances the handle's read
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    /// Fire `will_send_notifications`/`did_send_notifications` even when the
    /// handle has no callbacks
    #[serde(default = "default_true")]
    pub notify_without_subscribers: bool,
    /// Make `begin_transaction` wait for notifiers to catch up first
    #[serde(default = "default_true")]
    pub wait_for_notifiers_on_write: bool,
    /// Worker threads computing change sets
    #[serde(default = "default_notifier_threads")]
    pub notifier_threads: usize,
}

fn default_true() -> bool {
    true
}

fn default_notifier_threads() -> usize {
    2
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            automatic_change_notifications: true,
            auto_refresh: true,
            notify_without_subscribers: true,
            wait_for_notifiers_on_write: true,
            notifier_threads: default_notifier_threads(),
        }
    }
}

impl HandleOptions {
    /// Parse options from TOML text
    pub fn from_toml_str(content: &str) -> StrataResult<Self> {
        toml::from_str(content)
            .map_err(|e| StrataError::invalid_config(format!("Failed to parse options: {}", e)))
    }

    /// Read and parse options from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::internal(format!(
                "Failed to read options file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            StrataError::invalid_config(format!(
                "Failed to parse options file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> StrataResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StrataError::internal(format!("Failed to serialize options: {}", e)))
    }
}

// ============================================================================
// Config
// ============================================================================

/// Everything needed to open a handle
#[derive(Clone)]
pub struct Config {
    /// Database file path
    pub path: PathBuf,
    /// Declared schema; `None` opens the file with whatever schema it has
    pub schema: Option<Schema>,
    /// Declared schema version (`NOT_VERSIONED` when no schema is declared)
    pub schema_version: u64,
    /// How schema differences are resolved
    pub schema_mode: SchemaMode,
    /// Reuse an open handle for the same thread or execution context
    pub cache: bool,
    /// Bind the handle to this context instead of the opening thread
    pub execution_context: Option<ExecutionContextId>,
    /// Encryption key; only its shape is validated
    pub encryption_key: Option<Vec<u8>>,
    /// Keep the database in memory only
    pub in_memory: bool,
    /// Called when the schema version increases
    pub migration_function: Option<MigrationFunction>,
    /// Called when the file is initialized
    pub initialization_function: Option<InitializationFunction>,
    /// Asked once, when the file is first opened in this process
    pub should_compact_on_launch_function: Option<ShouldCompactFunction>,
    /// Runtime options
    pub options: HandleOptions,
}

impl Config {
    /// Default configuration for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Config {
            path: path.into(),
            schema: None,
            schema_version: NOT_VERSIONED,
            schema_mode: SchemaMode::Automatic,
            cache: true,
            execution_context: None,
            encryption_key: None,
            in_memory: false,
            migration_function: None,
            initialization_function: None,
            should_compact_on_launch_function: None,
            options: HandleOptions::default(),
        }
    }

    /// Declare a schema and its version
    pub fn with_schema(mut self, schema: Schema, schema_version: u64) -> Self {
        self.schema = Some(schema);
        self.schema_version = schema_version;
        self
    }

    /// Check the configuration for contradictions before opening
    pub fn validate(&self) -> StrataResult<()> {
        if let Some(key) = &self.encryption_key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(StrataError::invalid_config(format!(
                    "Encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                )));
            }
        }
        if self.schema.is_some() && self.schema_version == NOT_VERSIONED {
            return Err(StrataError::invalid_config(
                "A schema version must be specified when the schema is specified",
            ));
        }
        if self.migration_function.is_some()
            && (self.schema_mode.is_read_only() || self.schema_mode == SchemaMode::Additive)
        {
            return Err(StrataError::invalid_config(format!(
                "Migration functions are not supported with schema mode {:?}",
                self.schema_mode
            )));
        }
        if self.initialization_function.is_some() && self.schema_mode.is_read_only() {
            return Err(StrataError::invalid_config(format!(
                "Initialization functions are not supported with schema mode {:?}",
                self.schema_mode
            )));
        }
        Ok(())
    }

    /// Error describing how `other` conflicts with this active config, if it does
    pub(crate) fn mismatch(&self, other: &Config) -> Option<String> {
        if self.schema_version != NOT_VERSIONED
            && other.schema_version != NOT_VERSIONED
            && self.schema_version != other.schema_version
        {
            return Some(format!(
                "Handle at path '{}' already opened with different schema version ({} vs {})",
                self.path.display(),
                self.schema_version,
                other.schema_version
            ));
        }
        if self.schema_mode != other.schema_mode {
            return Some(format!(
                "Handle at path '{}' already opened with a different schema mode",
                self.path.display()
            ));
        }
        if self.in_memory != other.in_memory {
            return Some(format!(
                "Handle at path '{}' already opened with different in-memory settings",
                self.path.display()
            ));
        }
        if let (Some(active), Some(requested)) = (&self.schema, &other.schema) {
            if self.schema_version == other.schema_version
                && active
                    .compare(requested)
                    .iter()
                    .any(|c| c.requires_migration())
            {
                return Some(format!(
                    "Handle at path '{}' already opened with a different schema",
                    self.path.display()
                ));
            }
        }
        None
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("schema", &self.schema.as_ref().map(Schema::len))
            .field("schema_version", &self.schema_version)
            .field("schema_mode", &self.schema_mode)
            .field("cache", &self.cache)
            .field("execution_context", &self.execution_context)
            .field("encrypted", &self.encryption_key.is_some())
            .field("in_memory", &self.in_memory)
            .field("migration_function", &self.migration_function.is_some())
            .field(
                "initialization_function",
                &self.initialization_function.is_some(),
            )
            .field("options", &self.options)
            .finish()
    }
}
