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

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// An optimistic write kept losing to concurrent writers.
    #[error("Write conflict on '{key}' persisted after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },
}

impl DatabaseError {
    /// Whether SQLite reported the database as busy or locked by another
    /// connection. Such failures are worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the write is worth attempting again: the database was busy
    /// or an optimistic version check failed.
    pub fn is_retryable(&self) -> bool {
        self.is_busy() || matches!(self, DatabaseError::Conflict { .. })
    }
}
