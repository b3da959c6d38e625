//! Error types for the migration library.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side of the migration a store plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    /// Source of truth (PostgreSQL in production).
    Primary,
    /// Migration target receiving shadow writes and forklift copies.
    Secondary,
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRole::Primary => write!(f, "primary"),
            StoreRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver, network or pool failure talking to a store.
    ///
    /// Aborts the current scope only: one check, one table copy or one online write.
    #[error("Connectivity error ({store} store): {message}")]
    Connectivity { store: StoreRole, message: String },

    /// Duplicate key, foreign key or not-null violation. Recorded as a skip.
    #[error("Integrity violation on {table}: {message}")]
    Integrity { table: String, message: String },

    /// Any other SQL error. Surfaced to the run result instead of swallowed.
    #[error("Unexpected store error on {table}: {message}")]
    UnexpectedStore { table: String, message: String },

    /// Table name not present in the migration catalog.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Start a fresh run instead.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Config error
    pub fn config(message: impl fmt::Display) -> Self {
        MigrateError::Config(message.to_string())
    }

    /// Create a Connectivity error for the given store.
    pub fn connectivity(store: StoreRole, message: impl fmt::Display) -> Self {
        MigrateError::Connectivity {
            store,
            message: message.to_string(),
        }
    }

    /// Create an Integrity error
    pub fn integrity(table: impl Into<String>, message: impl fmt::Display) -> Self {
        MigrateError::Integrity {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create an UnexpectedStore error
    pub fn unexpected(table: impl Into<String>, message: impl fmt::Display) -> Self {
        MigrateError::UnexpectedStore {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// True for driver/network failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, MigrateError::Connectivity { .. })
    }

    /// True for duplicate-key / FK / not-null violations.
    pub fn is_integrity(&self) -> bool {
        matches!(self, MigrateError::Integrity { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::UnknownTable(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged => 1,
            MigrateError::Connectivity { .. } => 2,
            MigrateError::Integrity { .. } | MigrateError::UnexpectedStore { .. } => 3,
            MigrateError::State(_) | MigrateError::Json(_) => 4,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
