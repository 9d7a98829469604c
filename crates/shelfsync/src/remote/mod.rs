//! Client side of the managed document-search service.
//!
//! The upload engine only talks to the remote through [`DocumentIndex`], so
//! tests can drive it with a scripted fake.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod http;

pub use error::{RemoteError, Result};
pub use http::HttpDocumentIndex;

/// A named collection in the remote index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHandle {
    /// Resource name, e.g. `fileSearchStores/abc123`.
    pub name: String,
    pub display_name: String,
}

/// Processing state of an uploaded file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Processing,
    Active,
    Failed,
    Unknown,
}

/// A time-limited handle to uploaded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Resource name, e.g. `files/abc123`.
    pub name: String,
    pub uri: String,
    pub status: FileStatus,
    /// After this instant the remote discards the bytes.
    pub expiration: Option<DateTime<Utc>>,
}

/// State of a remote import operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded { document_id: Option<String> },
    Failed { message: String },
}

impl OperationStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Protocol of the remote document index: upload bytes, import them into
/// a store, poll the import.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Finds the store with `display_name`, creating it if missing.
    async fn ensure_store(&self, display_name: &str) -> Result<StoreHandle>;

    async fn upload_file(
        &self,
        path: &Path,
        display_name: &str,
        mime_type: Option<&str>,
    ) -> Result<RemoteFile>;

    async fn get_file(&self, name: &str) -> Result<RemoteFile>;

    /// Submits an import of an uploaded file and returns the operation name.
    async fn import_file(&self, store: &StoreHandle, file_name: &str) -> Result<String>;

    async fn get_operation(&self, name: &str) -> Result<OperationStatus>;

    /// Deletes an uploaded file handle. Missing or forbidden counts as done.
    async fn delete_file(&self, name: &str) -> Result<()>;

    /// Deletes an indexed document. Missing or forbidden counts as done.
    async fn delete_document(&self, name: &str) -> Result<()>;

    /// Rate-limit headers from the most recent response.
    fn quota_headers(&self) -> Vec<(String, String)>;
}
