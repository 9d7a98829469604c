//! Upload engine error types.

use std::time::Duration;

use thiserror::Error;

use super::lifecycle::LifecycleError;
use crate::db::DatabaseError;
use crate::remote::RemoteError;

/// Errors from the durable upload state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("No file record for '{0}'")]
    FileNotFound(String),

    #[error("No operation named '{0}'")]
    OperationNotFound(String),

    #[error("Corrupt record for '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rusqlite::Error> for StateError {
    fn from(err: rusqlite::Error) -> Self {
        StateError::Database(DatabaseError::Sqlite(err))
    }
}

/// Errors that end a recovery pass.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Recovery did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Another instance holds the upload lock ({})", .holder.as_deref().unwrap_or("unknown holder"))]
    LockHeld { holder: Option<String> },

    #[error("Upload lock was taken over during recovery")]
    LockLost,

    #[error("Recovery could not read upload state: {0}")]
    State(#[from] StateError),
}

/// Errors that abort an upload run. Per-file failures never surface here.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Another instance holds the upload lock ({})", .holder.as_deref().unwrap_or("unknown holder"))]
    LockHeld { holder: Option<String> },

    #[error("Upload lock is no longer held by this instance")]
    LockLost,

    #[error("Upload state error: {0}")]
    State(#[from] StateError),

    #[error("Remote index error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
}

pub type Result<T> = std::result::Result<T, UploadError>;
