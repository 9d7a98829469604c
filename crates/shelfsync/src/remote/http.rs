//! HTTP client for the managed document-search API.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::error::{RemoteError, Result};
use super::{DocumentIndex, FileStatus, OperationStatus, RemoteFile, StoreHandle};

/// Public endpoint of the document-search API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_VERSION: &str = "v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";
const QUOTA_HEADER_PREFIX: &str = "x-ratelimit";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Uploads of large documents need far more than a typical API call.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreWire {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListStoresWire {
    #[serde(default)]
    file_search_stores: Vec<StoreWire>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileWire {
    name: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    expiration_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UploadResponseWire {
    file: FileWire,
}

#[derive(Debug, Deserialize)]
struct StatusWire {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationWire {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<StatusWire>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

fn file_from_wire(wire: FileWire) -> RemoteFile {
    let status = match wire.state.as_deref() {
        Some("PROCESSING") => FileStatus::Processing,
        Some("ACTIVE") => FileStatus::Active,
        Some("FAILED") => FileStatus::Failed,
        _ => FileStatus::Unknown,
    };
    RemoteFile {
        uri: wire.uri.unwrap_or_else(|| wire.name.clone()),
        name: wire.name,
        status,
        expiration: wire.expiration_time,
    }
}

fn operation_from_wire(wire: OperationWire) -> OperationStatus {
    if let Some(error) = wire.error {
        return OperationStatus::Failed {
            message: format!("{} (code {})", error.message, error.code),
        };
    }
    if !wire.done {
        return OperationStatus::Running;
    }
    let document_id = wire.response.as_ref().and_then(|response| {
        ["documentName", "document", "name"]
            .iter()
            .find_map(|key| response.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
    });
    log::debug!("Operation {} finished", wire.name);
    OperationStatus::Succeeded { document_id }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Treats "already gone" and "not ours to delete" as a finished delete.
fn idempotent_delete(result: Result<Response>, name: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(RemoteError::NotFound(_)) | Err(RemoteError::Permanent { status: 403, .. }) => {
            log::debug!("{} already gone or not deletable, treating as deleted", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// [`DocumentIndex`] over the public HTTP API, authenticated with an API
/// key.
pub struct HttpDocumentIndex {
    client: Client,
    base_url: String,
    api_key: SecretString,
    last_quota: Mutex<Vec<(String, String)>>,
}

impl HttpDocumentIndex {
    pub fn new(api_key: SecretString) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: SecretString) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transient(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            last_quota: Mutex::new(Vec::new()),
        })
    }

    fn api_url(&self, resource: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            API_VERSION,
            resource.trim_start_matches('/')
        )
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/{}/files", self.base_url, API_VERSION)
    }

    /// Sends an authenticated request and classifies any failure.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await?;
        self.capture_quota(response.headers());

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), &body, retry_after))
    }

    fn capture_quota(&self, headers: &HeaderMap) {
        let quota: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(QUOTA_HEADER_PREFIX))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        if quota.is_empty() {
            return;
        }
        if let Ok(mut last) = self.last_quota.lock() {
            *last = quota;
        }
    }

    async fn find_store(&self, display_name: &str) -> Result<Option<StoreHandle>> {
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(self.api_url("fileSearchStores"));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: ListStoresWire = self.send(request).await?.json().await?;
            if let Some(store) = page
                .file_search_stores
                .into_iter()
                .find(|s| s.display_name.as_deref() == Some(display_name))
            {
                return Ok(Some(StoreHandle {
                    name: store.name,
                    display_name: display_name.to_string(),
                }));
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl DocumentIndex for HttpDocumentIndex {
    async fn ensure_store(&self, display_name: &str) -> Result<StoreHandle> {
        if let Some(store) = self.find_store(display_name).await? {
            log::debug!("Using existing store {}", store.name);
            return Ok(store);
        }
        let request = self
            .client
            .post(self.api_url("fileSearchStores"))
            .json(&json!({ "displayName": display_name }));
        let created: StoreWire = self.send(request).await?.json().await?;
        log::info!("Created store '{}' as {}", display_name, created.name);
        Ok(StoreHandle {
            name: created.name,
            display_name: display_name.to_string(),
        })
    }

    async fn upload_file(
        &self,
        path: &Path,
        display_name: &str,
        mime_type: Option<&str>,
    ) -> Result<RemoteFile> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RemoteError::LocalFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let mime_type = mime_type.unwrap_or("application/octet-stream");

        let start = self
            .client
            .post(self.upload_url())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }));
        let response = self.send(start).await?;
        let session_url = response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Decode("upload session URL missing".to_string()))?;

        let finalize = self
            .client
            .post(&session_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .header(CONTENT_LENGTH, bytes.len().to_string())
            .body(bytes);
        let uploaded: UploadResponseWire = self.send(finalize).await?.json().await?;
        Ok(file_from_wire(uploaded.file))
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile> {
        let wire: FileWire = self
            .send(self.client.get(self.api_url(name)))
            .await?
            .json()
            .await?;
        Ok(file_from_wire(wire))
    }

    async fn import_file(&self, store: &StoreHandle, file_name: &str) -> Result<String> {
        let request = self
            .client
            .post(self.api_url(&format!("{}:importFile", store.name)))
            .json(&json!({ "fileName": file_name }));
        let operation: OperationWire = self.send(request).await?.json().await?;
        Ok(operation.name)
    }

    async fn get_operation(&self, name: &str) -> Result<OperationStatus> {
        let wire: OperationWire = self
            .send(self.client.get(self.api_url(name)))
            .await?
            .json()
            .await?;
        Ok(operation_from_wire(wire))
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let result = self.send(self.client.delete(self.api_url(name))).await;
        idempotent_delete(result, name)
    }

    async fn delete_document(&self, name: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.api_url(name))
            .query(&[("force", "true")]);
        let result = self.send(request).await;
        idempotent_delete(result, name)
    }

    fn quota_headers(&self) -> Vec<(String, String)> {
        self.last_quota
            .lock()
            .map(|quota| quota.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn index() -> HttpDocumentIndex {
        HttpDocumentIndex::with_base_url(
            "https://index.example.com/",
            SecretString::from("test-key".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let index = index();
        assert_eq!(
            index.api_url("files/abc"),
            "https://index.example.com/v1beta/files/abc"
        );
        assert_eq!(
            index.upload_url(),
            "https://index.example.com/upload/v1beta/files"
        );
    }

    #[test]
    fn test_file_from_wire() {
        let wire: FileWire = serde_json::from_value(json!({
            "name": "files/abc",
            "uri": "https://index.example.com/v1beta/files/abc",
            "state": "ACTIVE",
            "expirationTime": "2026-03-01T12:00:00Z"
        }))
        .unwrap();
        let file = file_from_wire(wire);
        assert_eq!(file.status, FileStatus::Active);
        assert_eq!(
            file.expiration.unwrap().to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );

        let wire: FileWire = serde_json::from_value(json!({ "name": "files/x" })).unwrap();
        let file = file_from_wire(wire);
        assert_eq!(file.status, FileStatus::Unknown);
        assert_eq!(file.uri, "files/x");
    }

    #[test]
    fn test_operation_from_wire() {
        let running: OperationWire =
            serde_json::from_value(json!({ "name": "ops/1" })).unwrap();
        assert_eq!(operation_from_wire(running), OperationStatus::Running);

        let done: OperationWire = serde_json::from_value(json!({
            "name": "ops/1",
            "done": true,
            "response": { "documentName": "stores/s/documents/d1" }
        }))
        .unwrap();
        assert_eq!(
            operation_from_wire(done),
            OperationStatus::Succeeded {
                document_id: Some("stores/s/documents/d1".to_string())
            }
        );

        let failed: OperationWire = serde_json::from_value(json!({
            "name": "ops/1",
            "done": true,
            "error": { "code": 3, "message": "unsupported file" }
        }))
        .unwrap();
        assert_eq!(
            operation_from_wire(failed),
            OperationStatus::Failed {
                message: "unsupported file (code 3)".to_string()
            }
        );
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_idempotent_delete() {
        assert!(idempotent_delete(Err(RemoteError::NotFound("gone".into())), "files/a").is_ok());
        assert!(idempotent_delete(
            Err(RemoteError::Permanent {
                status: 403,
                message: "forbidden".into()
            }),
            "files/a"
        )
        .is_ok());
        assert!(idempotent_delete(Err(RemoteError::Transient("reset".into())), "files/a").is_err());
    }

    #[test]
    fn test_quota_capture() {
        let index = index();
        assert!(index.quota_headers().is_empty());
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("17"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        index.capture_quota(&headers);
        assert_eq!(
            index.quota_headers(),
            vec![("x-ratelimit-remaining".to_string(), "17".to_string())]
        );
    }
}
