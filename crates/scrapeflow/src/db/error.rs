//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A status change that would move a row backwards.
    #[error("Run '{id}' cannot move to '{to}' from its current status")]
    InvalidTransition { id: String, to: String },

    /// A row the caller expected to exist is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored value could not be interpreted.
    #[error("Corrupt column '{column}': {value}")]
    Corrupt { column: &'static str, value: String },

    /// JSON encoding of a stored column failed.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    /// Busy/locked databases clear up on their own; everything else needs a fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            DatabaseError::Io { .. } => true,
            _ => false,
        }
    }

    /// True when SQLite rejected a write because of a UNIQUE/CHECK/trigger constraint.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DatabaseError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ),
            _ => false,
        }
    }
}
