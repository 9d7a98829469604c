//! Durable upload state.
//!
//! `StateManager` is the only writer of lifecycle state. Every lifecycle
//! change is validated against the FSM, written with an optimistic version
//! check, and recorded in the transition history, all in one transaction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;

use super::error::StateError;
use super::lifecycle::{
    self, failure_transition, path_to_untracked, path_to_uploading, FileLifecycle, FileState,
    Transition,
};
use crate::db::batch_repo::{self, BatchRow};
use crate::db::file_repo::{self, FileRow, TransitionRow};
use crate::db::lock_repo::{self, LockRow};
use crate::db::operation_repo::{self, OperationRow};
use crate::db::{Database, DatabaseError};

pub type Result<T> = std::result::Result<T, StateError>;

/// Attempts made for a write that keeps losing to another writer.
const MAX_WRITE_ATTEMPTS: u32 = 5;
/// First backoff step for a retried write, doubled per attempt.
const WRITE_BACKOFF_BASE_MS: u64 = 10;

/// Default number of permanent failures after which a file is quarantined.
pub const DEFAULT_QUARANTINE_AFTER: u32 = 3;
/// Default lease of the single-writer lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// Resolution state of a remote import operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    DoneSuccess,
    DoneError,
    /// The poll gave up before the remote finished.
    Timeout,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::DoneSuccess => "done_success",
            OperationState::DoneError => "done_error",
            OperationState::Timeout => "timeout",
        }
    }

    /// Whether the remote outcome is still unknown.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, OperationState::Pending | OperationState::Timeout)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "done_success" => Ok(OperationState::DoneSuccess),
            "done_error" => Ok(OperationState::DoneError),
            "timeout" => Ok(OperationState::Timeout),
            other => Err(format!("unknown operation state '{}'", other)),
        }
    }
}

/// How an upload attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    /// The remote rejected the file itself. Counts toward quarantine.
    Permanent,
    RateLimited,
}

/// Final status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Completed,
    /// Shutdown was requested while the batch ran.
    Interrupted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Interrupted => "interrupted",
        }
    }
}

/// Typed view of a file record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub content_fingerprint: Option<String>,
    pub state: FileState,
    pub remote_file_id: Option<String>,
    pub remote_uri: Option<String>,
    pub remote_doc_id: Option<String>,
    pub remote_expiration: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub upload_attempts: u32,
    pub permanent_failures: u32,
    pub updated_at: String,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = StateError;

    fn try_from(row: FileRow) -> Result<Self> {
        let state = row.lifecycle_state.parse::<FileState>()?;
        let remote_expiration = match row.remote_expiration_ts {
            Some(ts) => Some(DateTime::from_timestamp(ts, 0).ok_or_else(|| {
                StateError::Corrupt {
                    key: row.path.clone(),
                    reason: format!("expiration timestamp {} out of range", ts),
                }
            })?),
            None => None,
        };
        Ok(Self {
            path: row.path,
            filename: row.filename,
            size_bytes: row.size_bytes,
            mime_type: row.mime_type,
            content_fingerprint: row.content_fingerprint,
            state,
            remote_file_id: row.remote_file_id,
            remote_uri: row.remote_uri,
            remote_doc_id: row.remote_doc_id,
            remote_expiration,
            last_error: row.last_error,
            upload_attempts: row.upload_attempts,
            permanent_failures: row.permanent_failures,
            updated_at: row.updated_at,
        })
    }
}

/// Typed view of an operation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub name: String,
    pub file_path: String,
    pub state: OperationState,
    pub error: Option<String>,
}

impl TryFrom<OperationRow> for OperationRecord {
    type Error = StateError;

    fn try_from(row: OperationRow) -> Result<Self> {
        let state = row
            .state
            .parse::<OperationState>()
            .map_err(|reason| StateError::Corrupt {
                key: row.name.clone(),
                reason,
            })?;
        Ok(Self {
            name: row.name,
            file_path: row.file_path,
            state,
            error: row.error,
        })
    }
}

/// One recorded lifecycle edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: FileState,
    pub to: FileState,
    pub transition: Transition,
    pub at: String,
}

/// A file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub path: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub content_fingerprint: String,
}

/// Outcome of registering a discovered file.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    New,
    Unchanged,
    /// Known file whose content differs from the recorded fingerprint.
    /// Nothing was written; the caller decides how to retire the old
    /// remote copy.
    Changed(FileRecord),
}

/// File counts per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub untracked: u64,
    pub uploading: u64,
    pub processing: u64,
    pub indexed: u64,
    pub failed: u64,
    /// Failed files excluded from uploads. Included in `failed`.
    pub quarantined: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.untracked + self.uploading + self.processing + self.indexed + self.failed
    }
}

/// A file row loaded for modification, plus the edges applied to it.
struct FileEdit {
    row: FileRow,
    lifecycle: FileLifecycle,
    applied: Vec<(FileState, FileState, Transition)>,
}

impl FileEdit {
    fn load(row: FileRow) -> Result<Self> {
        let state = row.lifecycle_state.parse::<FileState>()?;
        Ok(Self {
            row,
            lifecycle: FileLifecycle::new(state),
            applied: Vec::new(),
        })
    }

    fn state(&self) -> FileState {
        self.lifecycle.state()
    }

    fn apply(&mut self, transition: Transition) -> Result<()> {
        let from = self.lifecycle.state();
        let to = self.lifecycle.apply(transition)?;
        self.applied.push((from, to, transition));
        Ok(())
    }

    fn apply_all(&mut self, transitions: &[Transition]) -> Result<()> {
        for transition in transitions {
            self.apply(*transition)?;
        }
        Ok(())
    }
}

/// Runs `op` again while it fails with a retryable database error,
/// sleeping a jittered exponential backoff in between.
///
/// The sleep blocks the calling thread. `StateManager` is synchronous and is
/// called from upload and poll futures, so a conflicting write stalls every
/// future sharing that task, for at most 225 ms across all attempts.
///
/// After the last attempt the failure surfaces as
/// [`DatabaseError::Conflict`].
pub(crate) fn retry_on_conflict<T, F>(key: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(StateError::Database(err)) if err.is_retryable() => {
                if attempt >= MAX_WRITE_ATTEMPTS {
                    log::warn!(
                        "Write to '{}' still conflicting after {} attempts: {}",
                        key,
                        attempt,
                        err
                    );
                    return Err(DatabaseError::Conflict {
                        key: key.to_string(),
                        attempts: attempt,
                    }
                    .into());
                }
                let delay = backoff_delay(attempt);
                log::debug!(
                    "Write to '{}' conflicted ({}), retrying in {:?}",
                    key,
                    err,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = WRITE_BACKOFF_BASE_MS << (attempt.saturating_sub(1)).min(6);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Durable record of files, operations, batches and the writer lock.
#[derive(Clone)]
pub struct StateManager {
    db: Database,
    quarantine_after: u32,
    lock_ttl: Duration,
}

impl StateManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            quarantine_after: DEFAULT_QUARANTINE_AFTER,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_quarantine_after(mut self, quarantine_after: u32) -> Self {
        self.quarantine_after = quarantine_after.max(1);
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn quarantine_after(&self) -> u32 {
        self.quarantine_after
    }

    // ---- writer lock ----

    /// Claims the single-writer lock. Returns `false` while another live
    /// instance holds it; a holder whose heartbeat is older than the lease
    /// is taken over.
    pub fn acquire_lock(&self, instance_id: &str) -> Result<bool> {
        let now = Utc::now();
        let stale_before = now.timestamp() - self.lock_ttl.as_secs() as i64;
        let acquired = retry_on_conflict("lock", || {
            Ok(lock_repo::try_acquire(
                &self.db,
                instance_id,
                &now.to_rfc3339(),
                now.timestamp(),
                stale_before,
            )?)
        })?;
        if acquired {
            log::info!("Acquired upload lock as {}", instance_id);
        }
        Ok(acquired)
    }

    /// Extends the lease. Returns `false` if the lock was lost.
    pub fn heartbeat(&self, instance_id: &str) -> Result<bool> {
        let alive = retry_on_conflict("lock", || {
            Ok(lock_repo::heartbeat(
                &self.db,
                instance_id,
                Utc::now().timestamp(),
            )?)
        })?;
        if !alive {
            log::warn!("Upload lock is no longer held by {}", instance_id);
        }
        Ok(alive)
    }

    pub fn release_lock(&self, instance_id: &str) -> Result<bool> {
        let released = retry_on_conflict("lock", || Ok(lock_repo::release(&self.db, instance_id)?))?;
        if released {
            log::info!("Released upload lock held by {}", instance_id);
        }
        Ok(released)
    }

    pub fn lock_holder(&self) -> Result<Option<LockRow>> {
        Ok(lock_repo::current(&self.db)?)
    }

    // ---- file registration ----

    /// Records a discovered file. New files start `untracked`.
    pub fn register_file(&self, file: &NewFile) -> Result<Registration> {
        retry_on_conflict(&file.path, || {
            self.db.with_conn(|conn| {
                if let Some(existing) = file_repo::find_by_path(conn, &file.path)? {
                    if existing.content_fingerprint.as_deref() == Some(&file.content_fingerprint) {
                        return Ok(Registration::Unchanged);
                    }
                    return Ok(Registration::Changed(FileRecord::try_from(existing)?));
                }
                let now = now_rfc3339();
                file_repo::insert(
                    conn,
                    &FileRow {
                        path: file.path.clone(),
                        filename: file.filename.clone(),
                        size_bytes: file.size_bytes,
                        mime_type: file.mime_type.clone(),
                        content_fingerprint: Some(file.content_fingerprint.clone()),
                        lifecycle_state: FileState::Untracked.as_str().to_string(),
                        remote_file_id: None,
                        remote_uri: None,
                        remote_doc_id: None,
                        remote_expiration_ts: None,
                        last_error: None,
                        upload_attempts: 0,
                        permanent_failures: 0,
                        version: 0,
                        created_at: now.clone(),
                        updated_at: now,
                    },
                )?;
                Ok(Registration::New)
            })
        })
    }

    /// Applies a content change to a known file.
    ///
    /// With the old remote copy retired (`remote_deleted`), the file takes
    /// the new fingerprint, loses its failure history and returns to
    /// `untracked`. Otherwise an indexed file is marked failed and keeps its
    /// old fingerprint so the next scan retries the retirement.
    pub fn mark_index_stale(
        &self,
        path: &str,
        fingerprint: &str,
        size_bytes: i64,
        remote_deleted: bool,
    ) -> Result<FileState> {
        self.modify_file(path, |_, edit| {
            if matches!(edit.state(), FileState::Uploading | FileState::Processing) {
                return Err(lifecycle::LifecycleError::InvalidTransition {
                    from: edit.state(),
                    transition: Transition::Reset,
                }
                .into());
            }
            if remote_deleted {
                edit.apply_all(path_to_untracked(edit.state()))?;
                edit.row.clear_remote();
                edit.row.content_fingerprint = Some(fingerprint.to_string());
                edit.row.size_bytes = size_bytes;
                edit.row.permanent_failures = 0;
                edit.row.last_error = None;
            } else {
                if edit.state() == FileState::Indexed {
                    edit.apply(Transition::FailReset)?;
                }
                edit.row.last_error =
                    Some("content changed but the indexed copy could not be removed".to_string());
            }
            Ok(edit.state())
        })
    }

    // ---- upload lifecycle ----

    /// Durably announces an upload attempt. Must commit before the remote
    /// upload call starts.
    pub fn record_upload_intent(&self, path: &str) -> Result<()> {
        self.modify_file(path, |_, edit| {
            edit.apply_all(path_to_uploading(edit.state())?)?;
            edit.row.clear_remote();
            edit.row.last_error = None;
            edit.row.upload_attempts += 1;
            Ok(())
        })
    }

    /// Checkpoints the remote file handle between upload and import.
    pub fn record_remote_file(
        &self,
        path: &str,
        remote_file_id: &str,
        remote_uri: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.modify_file(path, |_, edit| {
            require_state(edit, FileState::Uploading, Transition::CompleteUpload)?;
            edit.row.remote_file_id = Some(remote_file_id.to_string());
            edit.row.remote_uri = Some(remote_uri.to_string());
            edit.row.remote_expiration_ts = expiration.map(|e| e.timestamp());
            Ok(())
        })
    }

    /// Records a finished upload and the import operation it started.
    pub fn record_upload_success(
        &self,
        path: &str,
        remote_uri: &str,
        remote_file_id: &str,
        operation_name: &str,
    ) -> Result<()> {
        self.modify_file(path, |conn, edit| {
            edit.apply(Transition::CompleteUpload)?;
            edit.row.remote_file_id = Some(remote_file_id.to_string());
            edit.row.remote_uri = Some(remote_uri.to_string());
            insert_pending_operation(conn, operation_name, path)?;
            Ok(())
        })
    }

    /// Records a failed attempt. Permanent failures count toward
    /// quarantine.
    pub fn record_upload_failure(&self, path: &str, message: &str, kind: FailureKind) -> Result<()> {
        self.modify_file(path, |_, edit| {
            let transition = failure_transition(edit.state()).ok_or(
                lifecycle::LifecycleError::InvalidTransition {
                    from: edit.state(),
                    transition: Transition::FailUpload,
                },
            )?;
            edit.apply(transition)?;
            edit.row.clear_remote();
            edit.row.last_error = Some(message.to_string());
            if kind == FailureKind::Permanent {
                edit.row.permanent_failures += 1;
                if edit.row.permanent_failures >= self.quarantine_after {
                    log::warn!(
                        "Quarantining {} after {} permanent failures",
                        path,
                        edit.row.permanent_failures
                    );
                }
            }
            Ok(())
        })
    }

    /// Records a successful import. Repeating it for an indexed file only
    /// settles the operation.
    pub fn record_import_success(
        &self,
        path: &str,
        operation_name: &str,
        document_id: Option<&str>,
    ) -> Result<()> {
        self.modify_file(path, |conn, edit| {
            if edit.state() != FileState::Indexed {
                edit.apply(Transition::CompleteProcessing)?;
            }
            if let Some(doc_id) = document_id {
                edit.row.remote_doc_id = Some(doc_id.to_string());
            }
            edit.row.last_error = None;
            set_operation_state(conn, operation_name, OperationState::DoneSuccess, None)?;
            Ok(())
        })
    }

    /// Records a failed import: the operation is settled as an error and
    /// the file fails.
    pub fn record_import_failure(&self, path: &str, operation_name: &str, message: &str) -> Result<()> {
        self.modify_file(path, |conn, edit| {
            edit.apply(Transition::FailProcessing)?;
            edit.row.clear_remote();
            edit.row.last_error = Some(message.to_string());
            set_operation_state(conn, operation_name, OperationState::DoneError, Some(message))?;
            Ok(())
        })
    }

    /// Updates an operation without touching its file.
    pub fn update_operation_state(
        &self,
        operation_name: &str,
        state: OperationState,
        error: Option<&str>,
    ) -> Result<()> {
        retry_on_conflict(operation_name, || {
            self.db
                .with_conn(|conn| set_operation_state(conn, operation_name, state, error))
        })
    }

    /// Returns a file to `untracked` through legal edges, clearing remote
    /// identifiers and settling any unresolved operations as errors.
    ///
    /// Returns `false` if the file was already untracked with nothing to
    /// clear.
    pub fn reset_to_pending(&self, path: &str, reason: &str) -> Result<bool> {
        self.modify_file(path, |conn, edit| {
            let had_remote = edit.row.remote_file_id.is_some()
                || edit.row.remote_uri.is_some()
                || edit.row.remote_doc_id.is_some()
                || edit.row.remote_expiration_ts.is_some();
            edit.apply_all(path_to_untracked(edit.state()))?;
            edit.row.clear_remote();
            edit.row.last_error = Some(reason.to_string());
            let settled = operation_repo::resolve_all_for_file(
                conn,
                path,
                OperationState::DoneError.as_str(),
                Some(reason),
                &now_rfc3339(),
            )?;
            Ok(had_remote || settled > 0 || !edit.applied.is_empty())
        })
    }

    /// Advances an interrupted upload whose remote handle was recorded to
    /// `processing`, tracking the import submitted for it.
    pub fn mark_recovered_upload(&self, path: &str, operation_name: &str) -> Result<()> {
        self.modify_file(path, |conn, edit| {
            if edit.row.remote_file_id.is_none() {
                return Err(StateError::Corrupt {
                    key: path.to_string(),
                    reason: "no remote file handle recorded".to_string(),
                });
            }
            edit.apply(Transition::CompleteUpload)?;
            insert_pending_operation(conn, operation_name, path)?;
            Ok(())
        })
    }

    // ---- batches ----

    pub fn start_batch(&self, run_id: &str, number: u32, size: u32) -> Result<i64> {
        Ok(batch_repo::insert_started(
            &self.db,
            run_id,
            number,
            size,
            &now_rfc3339(),
        )?)
    }

    pub fn finish_batch(
        &self,
        batch_id: i64,
        succeeded: u32,
        failed: u32,
        status: BatchStatus,
    ) -> Result<()> {
        Ok(batch_repo::finish(
            &self.db,
            batch_id,
            succeeded,
            failed,
            status.as_str(),
            &now_rfc3339(),
        )?)
    }

    pub fn batches_for_run(&self, run_id: &str) -> Result<Vec<BatchRow>> {
        Ok(batch_repo::find_by_run(&self.db, run_id)?)
    }

    // ---- queries ----

    /// Files waiting for an upload, oldest first, excluding quarantined
    /// files.
    pub fn get_pending_files(&self, limit: u64) -> Result<Vec<FileRecord>> {
        let rows = self
            .db
            .with_conn(|conn| file_repo::find_pending(conn, limit, self.quarantine_after))?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    pub fn get_uploading_files(&self) -> Result<Vec<FileRecord>> {
        self.files_in_state(FileState::Uploading)
    }

    pub fn files_in_state(&self, state: FileState) -> Result<Vec<FileRecord>> {
        let rows = self
            .db
            .with_conn(|conn| file_repo::find_by_state(conn, state.as_str()))?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Operations whose remote outcome is still unknown.
    pub fn get_pending_operations(&self) -> Result<Vec<OperationRecord>> {
        let rows = self.db.with_conn(operation_repo::find_unresolved)?;
        rows.into_iter().map(OperationRecord::try_from).collect()
    }

    /// In-flight files holding a time-limited remote handle, soonest
    /// expiry first.
    pub fn get_files_with_expiration(&self) -> Result<Vec<FileRecord>> {
        let rows = self.db.with_conn(file_repo::find_with_expiration)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = self.db.with_conn(|conn| file_repo::find_by_path(conn, path))?;
        row.map(FileRecord::try_from).transpose()
    }

    pub fn get_operation(&self, name: &str) -> Result<Option<OperationRecord>> {
        let row = self
            .db
            .with_conn(|conn| operation_repo::find_by_name(conn, name))?;
        row.map(OperationRecord::try_from).transpose()
    }

    pub fn count_by_state(&self) -> Result<StateCounts> {
        let (rows, quarantined) = self.db.with_conn(|conn| {
            Ok::<_, DatabaseError>((
                file_repo::count_by_state(conn)?,
                file_repo::count_quarantined(conn, self.quarantine_after)?,
            ))
        })?;
        let mut counts = StateCounts {
            quarantined,
            ..StateCounts::default()
        };
        for (state, count) in rows {
            match state.parse::<FileState>()? {
                FileState::Untracked => counts.untracked = count,
                FileState::Uploading => counts.uploading = count,
                FileState::Processing => counts.processing = count,
                FileState::Indexed => counts.indexed = count,
                FileState::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Lifecycle edges recorded for a file, in the order applied.
    pub fn transition_history(&self, path: &str) -> Result<Vec<TransitionRecord>> {
        let rows = self
            .db
            .with_conn(|conn| file_repo::find_transitions(conn, path))?;
        rows.into_iter()
            .map(|row| {
                let transition =
                    row.event
                        .parse::<Transition>()
                        .map_err(|reason| StateError::Corrupt {
                            key: row.file_path.clone(),
                            reason,
                        })?;
                Ok(TransitionRecord {
                    from: row.from_state.parse()?,
                    to: row.to_state.parse()?,
                    transition,
                    at: row.at,
                })
            })
            .collect()
    }

    /// Loads a file, lets `change` edit it, then writes the row and its
    /// transitions in one transaction guarded by the row version.
    fn modify_file<T, F>(&self, path: &str, mut change: F) -> Result<T>
    where
        F: FnMut(&Connection, &mut FileEdit) -> Result<T>,
    {
        retry_on_conflict(path, || {
            self.db.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                let row = file_repo::find_by_path(&tx, path)?
                    .ok_or_else(|| StateError::FileNotFound(path.to_string()))?;
                let expected_version = row.version;
                let mut edit = FileEdit::load(row)?;

                let out = change(&*tx, &mut edit)?;

                let now = now_rfc3339();
                edit.row.lifecycle_state = edit.state().as_str().to_string();
                edit.row.updated_at = now.clone();
                if !file_repo::update_checked(&tx, &edit.row, expected_version)? {
                    return Err(DatabaseError::Conflict {
                        key: path.to_string(),
                        attempts: 1,
                    }
                    .into());
                }
                for (from, to, transition) in &edit.applied {
                    file_repo::insert_transition(
                        &tx,
                        &TransitionRow {
                            file_path: path.to_string(),
                            from_state: from.as_str().to_string(),
                            to_state: to.as_str().to_string(),
                            event: transition.as_str().to_string(),
                            at: now.clone(),
                        },
                    )?;
                }
                tx.commit()?;
                Ok(out)
            })
        })
    }
}

fn require_state(edit: &FileEdit, expected: FileState, transition: Transition) -> Result<()> {
    if edit.state() == expected {
        Ok(())
    } else {
        Err(lifecycle::LifecycleError::InvalidTransition {
            from: edit.state(),
            transition,
        }
        .into())
    }
}

fn insert_pending_operation(conn: &Connection, name: &str, file_path: &str) -> Result<()> {
    let now = now_rfc3339();
    operation_repo::upsert(
        conn,
        &OperationRow {
            name: name.to_string(),
            file_path: file_path.to_string(),
            state: OperationState::Pending.as_str().to_string(),
            error: None,
            created_at: now.clone(),
            updated_at: now,
        },
    )?;
    Ok(())
}

fn set_operation_state(
    conn: &Connection,
    name: &str,
    state: OperationState,
    error: Option<&str>,
) -> Result<()> {
    if operation_repo::update_state(conn, name, state.as_str(), error, &now_rfc3339())? {
        Ok(())
    } else {
        Err(StateError::OperationNotFound(name.to_string()))
    }
}
