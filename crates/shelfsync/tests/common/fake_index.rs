//! Scripted remote index.
//!
//! Every call is answered from in-memory scripts and recorded, so tests can
//! assert on both the engine's outcome and the calls it made.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shelfsync::remote::{
    DocumentIndex, FileStatus, OperationStatus, RemoteError, RemoteFile, Result, StoreHandle,
};
use shelfsync::upload::{FileState, ShutdownController, StateManager};

pub const DOCUMENT_ID: &str = "documents/indexed";

/// Answers for one import operation: `steps` in order, then `then` forever.
#[derive(Debug, Clone)]
pub struct OpScript {
    steps: VecDeque<Result<OperationStatus>>,
    then: Result<OperationStatus>,
}

impl OpScript {
    pub fn succeed() -> Self {
        Self {
            steps: VecDeque::new(),
            then: Ok(OperationStatus::Succeeded {
                document_id: Some(DOCUMENT_ID.to_string()),
            }),
        }
    }

    pub fn succeed_after(running_polls: usize) -> Self {
        let mut script = Self::succeed();
        for _ in 0..running_polls {
            script.steps.push_back(Ok(OperationStatus::Running));
        }
        script
    }

    pub fn fail(message: &str) -> Self {
        Self {
            steps: VecDeque::new(),
            then: Ok(OperationStatus::Failed {
                message: message.to_string(),
            }),
        }
    }

    pub fn running_forever() -> Self {
        Self {
            steps: VecDeque::new(),
            then: Ok(OperationStatus::Running),
        }
    }

    pub fn error(err: RemoteError) -> Self {
        Self {
            steps: VecDeque::new(),
            then: Err(err),
        }
    }

    /// Answers `step` once before the scripted steps that follow.
    pub fn preceded_by(mut self, step: Result<OperationStatus>) -> Self {
        self.steps.push_front(step);
        self
    }

    fn next(&mut self) -> Result<OperationStatus> {
        self.steps.pop_front().unwrap_or_else(|| self.then.clone())
    }
}

struct Uploaded {
    file: RemoteFile,
    path: String,
    polls_until_active: u32,
}

struct Inner {
    next_id: u64,
    stores: Vec<StoreHandle>,
    upload_failures: VecDeque<RemoteError>,
    import_failures: VecDeque<RemoteError>,
    processing_polls: u32,
    fail_processing: bool,
    expiration: Option<chrono::Duration>,
    files: HashMap<String, Uploaded>,
    scripts_by_path: HashMap<String, OpScript>,
    default_script: OpScript,
    operations: HashMap<String, OpScript>,
    delete_failure: Option<RemoteError>,
    shutdown_after_uploads: Option<(usize, ShutdownController)>,

    uploads: Vec<String>,
    imports: Vec<String>,
    operation_polls: usize,
    deleted_files: Vec<String>,
    deleted_documents: Vec<String>,
    violations: Vec<String>,
}

pub struct FakeIndex {
    inner: Mutex<Inner>,
    state: Option<StateManager>,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                stores: Vec::new(),
                upload_failures: VecDeque::new(),
                import_failures: VecDeque::new(),
                processing_polls: 0,
                fail_processing: false,
                expiration: Some(chrono::Duration::hours(48)),
                files: HashMap::new(),
                scripts_by_path: HashMap::new(),
                default_script: OpScript::succeed(),
                operations: HashMap::new(),
                delete_failure: None,
                shutdown_after_uploads: None,
                uploads: Vec::new(),
                imports: Vec::new(),
                operation_polls: 0,
                deleted_files: Vec::new(),
                deleted_documents: Vec::new(),
                violations: Vec::new(),
            }),
            state: None,
        }
    }

    /// Checks on every upload that the file is durably `uploading`.
    pub fn watching(state: StateManager) -> Self {
        Self {
            state: Some(state),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    // ---- scripting ----

    /// The next upload call, whichever file it is for, fails with `err`.
    pub fn fail_next_upload(&self, err: RemoteError) {
        self.lock().upload_failures.push_back(err);
    }

    pub fn fail_next_import(&self, err: RemoteError) {
        self.lock().import_failures.push_back(err);
    }

    /// Uploaded files report `PROCESSING` for this many `get_file` calls.
    pub fn set_processing_polls(&self, polls: u32) {
        self.lock().processing_polls = polls;
    }

    /// Uploaded files end up `FAILED` instead of `ACTIVE`.
    pub fn set_fail_processing(&self, fail: bool) {
        self.lock().fail_processing = fail;
    }

    pub fn set_expiration(&self, expiration: Option<chrono::Duration>) {
        self.lock().expiration = expiration;
    }

    /// Script for imports of the file at `path`.
    pub fn script_path(&self, path: &str, script: OpScript) {
        self.lock().scripts_by_path.insert(path.to_string(), script);
    }

    pub fn set_default_script(&self, script: OpScript) {
        self.lock().default_script = script;
    }

    /// Script for an operation that exists remotely already.
    pub fn script_operation(&self, name: &str, script: OpScript) {
        self.lock().operations.insert(name.to_string(), script);
    }

    pub fn fail_deletes(&self, err: Option<RemoteError>) {
        self.lock().delete_failure = err;
    }

    /// Requests shutdown right after the `count`-th upload call.
    pub fn request_shutdown_after(&self, count: usize, shutdown: ShutdownController) {
        self.lock().shutdown_after_uploads = Some((count, shutdown));
    }

    // ---- recorded calls ----

    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn upload_count(&self, path: &str) -> usize {
        self.lock().uploads.iter().filter(|p| *p == path).count()
    }

    pub fn imports(&self) -> Vec<String> {
        self.lock().imports.clone()
    }

    pub fn operation_polls(&self) -> usize {
        self.lock().operation_polls
    }

    pub fn deleted_files(&self) -> Vec<String> {
        self.lock().deleted_files.clone()
    }

    pub fn deleted_documents(&self) -> Vec<String> {
        self.lock().deleted_documents.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    fn next_id(inner: &mut Inner) -> u64 {
        inner.next_id += 1;
        inner.next_id
    }
}

#[async_trait]
impl DocumentIndex for FakeIndex {
    async fn ensure_store(&self, display_name: &str) -> Result<StoreHandle> {
        let mut inner = self.lock();
        if let Some(store) = inner.stores.iter().find(|s| s.display_name == display_name) {
            return Ok(store.clone());
        }
        let id = Self::next_id(&mut inner);
        let store = StoreHandle {
            name: format!("fileSearchStores/store-{}", id),
            display_name: display_name.to_string(),
        };
        inner.stores.push(store.clone());
        Ok(store)
    }

    async fn upload_file(
        &self,
        path: &Path,
        _display_name: &str,
        _mime_type: Option<&str>,
    ) -> Result<RemoteFile> {
        let path = path.to_string_lossy().into_owned();

        if let Some(state) = &self.state {
            let recorded = state.get_file(&path).ok().flatten().map(|f| f.state);
            if recorded != Some(FileState::Uploading) {
                self.lock().violations.push(format!(
                    "{} reached the remote while recorded as {:?}",
                    path, recorded
                ));
            }
        }

        let mut inner = self.lock();
        inner.uploads.push(path.clone());
        if let Some((count, shutdown)) = &inner.shutdown_after_uploads {
            if inner.uploads.len() == *count {
                shutdown.request();
            }
        }
        if let Some(err) = inner.upload_failures.pop_front() {
            return Err(err);
        }

        let id = Self::next_id(&mut inner);
        let polls_until_active = inner.processing_polls;
        let status = if inner.fail_processing && polls_until_active == 0 {
            FileStatus::Failed
        } else if polls_until_active > 0 {
            FileStatus::Processing
        } else {
            FileStatus::Active
        };
        let expiration: Option<DateTime<Utc>> = inner.expiration.map(|ttl| Utc::now() + ttl);
        let file = RemoteFile {
            name: format!("files/file-{}", id),
            uri: format!("https://fake.invalid/files/file-{}", id),
            status,
            expiration,
        };
        inner.files.insert(
            file.name.clone(),
            Uploaded {
                file: file.clone(),
                path,
                polls_until_active,
            },
        );
        Ok(file)
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile> {
        let mut inner = self.lock();
        let fail_processing = inner.fail_processing;
        let uploaded = inner
            .files
            .get_mut(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
        if uploaded.polls_until_active > 0 {
            uploaded.polls_until_active -= 1;
        }
        if uploaded.polls_until_active == 0 {
            uploaded.file.status = if fail_processing {
                FileStatus::Failed
            } else {
                FileStatus::Active
            };
        }
        Ok(uploaded.file.clone())
    }

    async fn import_file(&self, _store: &StoreHandle, file_name: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.imports.push(file_name.to_string());
        if let Some(err) = inner.import_failures.pop_front() {
            return Err(err);
        }

        let path = inner.files.get(file_name).map(|u| u.path.clone());
        let script = path
            .and_then(|p| inner.scripts_by_path.get(&p).cloned())
            .unwrap_or_else(|| inner.default_script.clone());
        let id = Self::next_id(&mut inner);
        let name = format!("operations/op-{}", id);
        inner.operations.insert(name.clone(), script);
        Ok(name)
    }

    async fn get_operation(&self, name: &str) -> Result<OperationStatus> {
        let mut inner = self.lock();
        inner.operation_polls += 1;
        match inner.operations.get_mut(name) {
            Some(script) => script.next(),
            None => Err(RemoteError::NotFound(name.to_string())),
        }
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.files.remove(name);
        inner.deleted_files.push(name.to_string());
        Ok(())
    }

    async fn delete_document(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(err) = inner.delete_failure.clone() {
            return Err(err);
        }
        inner.deleted_documents.push(name.to_string());
        Ok(())
    }

    fn quota_headers(&self) -> Vec<(String, String)> {
        vec![("x-ratelimit-remaining".to_string(), "1000".to_string())]
    }
}
