//! Test harness for isolated test execution.
//!
//! `TestHarness` owns a temp library directory, an in-memory state store and
//! a `FakeIndex` watching that store, and builds orchestrators and recovery
//! managers with timings short enough for tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use shelfsync::db::Database;
use shelfsync::library::fingerprint_file;
use shelfsync::remote::{DocumentIndex, StoreHandle};
use shelfsync::upload::lifecycle::next_state;
use shelfsync::upload::{
    FileRecord, FileState, NewFile, OrchestratorConfig, RecoveryConfig, RecoveryManager,
    StateManager, ThroughputTier, UploadOrchestrator,
};

use super::fake_index::FakeIndex;

pub const STORE: &str = "test-library";

pub struct TestHarness {
    temp_dir: TempDir,
    pub library_dir: PathBuf,
    pub state: StateManager,
    pub index: Arc<FakeIndex>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let library_dir = temp_dir.path().join("library");
        std::fs::create_dir_all(&library_dir).expect("Failed to create library dir");

        let db = Database::open_in_memory().expect("Failed to open database");
        let state = StateManager::new(db);
        let index = Arc::new(FakeIndex::watching(state.clone()));

        Self {
            temp_dir,
            library_dir,
            state,
            index,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn dyn_index(&self) -> Arc<dyn DocumentIndex> {
        self.index.clone()
    }

    /// Writes a file into the library without registering it.
    pub fn write_file(&self, name: &str, content: &str) -> String {
        let path = self.library_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write library file");
        path.canonicalize()
            .expect("Failed to canonicalize")
            .to_string_lossy()
            .into_owned()
    }

    /// Writes and registers a file; returns its recorded path.
    pub fn add_file(&self, name: &str, content: &str) -> String {
        let path = self.write_file(name, content);
        let fingerprint = fingerprint_file(Path::new(&path)).expect("Failed to fingerprint");
        self.state
            .register_file(&NewFile {
                path: path.clone(),
                filename: name.to_string(),
                size_bytes: content.len() as i64,
                mime_type: Some("text/plain".to_string()),
                content_fingerprint: fingerprint,
            })
            .expect("Failed to register file");
        path
    }

    pub fn add_files(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| self.add_file(&format!("doc-{:03}.txt", i), &format!("document {}", i)))
            .collect()
    }

    pub fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            batch_size: 10,
            max_upload_concurrency: 5,
            poll_concurrency: 10,
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_secs(5),
            file_active_timeout: Duration::from_secs(2),
            tier: ThroughputTier::Custom(60_000),
            ..OrchestratorConfig::default()
        }
    }

    pub fn orchestrator(&self, config: OrchestratorConfig) -> UploadOrchestrator {
        UploadOrchestrator::new(self.state.clone(), self.dyn_index(), config)
    }

    pub fn fast_recovery_config() -> RecoveryConfig {
        RecoveryConfig {
            timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            danger_window: Duration::from_secs(8 * 60 * 60),
        }
    }

    pub fn store(&self) -> StoreHandle {
        StoreHandle {
            name: "fileSearchStores/recovery".to_string(),
            display_name: STORE.to_string(),
        }
    }

    pub fn recovery(&self, config: RecoveryConfig) -> RecoveryManager {
        RecoveryManager::new(self.state.clone(), self.dyn_index(), self.store(), config)
    }

    pub fn file(&self, path: &str) -> FileRecord {
        self.state
            .get_file(path)
            .expect("Failed to read file record")
            .expect("File not registered")
    }

    // ---- seeding interrupted runs ----

    /// A file whose upload intent was recorded but which never got a handle.
    pub fn seed_interrupted_upload(&self, path: &str) {
        self.state.record_upload_intent(path).unwrap();
    }

    /// A file that was uploaded and checkpointed but never imported.
    pub fn seed_uploaded(&self, path: &str, file_id: &str, expiration: Option<DateTime<Utc>>) {
        self.state.record_upload_intent(path).unwrap();
        self.state
            .record_remote_file(path, file_id, &format!("https://fake.invalid/{}", file_id), expiration)
            .unwrap();
    }

    /// A file whose import was submitted as `operation`.
    pub fn seed_processing(
        &self,
        path: &str,
        file_id: &str,
        operation: &str,
        expiration: Option<DateTime<Utc>>,
    ) {
        self.seed_uploaded(path, file_id, expiration);
        self.state
            .record_upload_success(path, &format!("https://fake.invalid/{}", file_id), file_id, operation)
            .unwrap();
    }

    /// Every recorded transition of `path` is an edge of the lifecycle.
    pub fn assert_history_legal(&self, path: &str) {
        let history = self.state.transition_history(path).unwrap();
        let mut expected_from = FileState::Untracked;
        for record in &history {
            assert_eq!(
                record.from, expected_from,
                "{}: history is not contiguous: {:?}",
                path, history
            );
            assert_eq!(
                next_state(record.from, record.transition).ok(),
                Some(record.to),
                "{}: illegal edge {:?}",
                path,
                record
            );
            expected_from = record.to;
        }
        assert_eq!(expected_from, self.file(path).state, "{}: history ends elsewhere", path);
    }
}
