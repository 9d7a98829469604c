use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;
use crate::upload::{RecoveryError, StateError, UploadError};

#[derive(Error, Debug)]
pub enum ShelfsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Remote index error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Library root '{0}' does not exist or is not a directory")]
    RootNotFound(PathBuf),

    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to record scanned file: {0}")]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, ShelfsyncError>;
