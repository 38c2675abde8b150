//! Error types for fieldlink-store.

use std::path::PathBuf;

use fieldlink_types::DeviceId;
use rusqlite::ffi::{SQLITE_CONSTRAINT_FOREIGNKEY, SQLITE_CONSTRAINT_UNIQUE};

/// Result type for fieldlink-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldlink-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A unique column (account email, device token) already holds this value.
    #[error("Already exists: {0}")]
    Conflict(String),

    /// The referenced device does not exist (or was deleted).
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// The referenced account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    /// The database was created by a newer schema than this build knows.
    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },
}

/// Whether a rusqlite error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Whether a rusqlite error is a FOREIGN KEY constraint violation.
pub(crate) fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
