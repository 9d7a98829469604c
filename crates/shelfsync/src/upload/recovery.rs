//! Startup reconciliation of state left behind by an interrupted run.
//!
//! Three phases run in order under one overall deadline:
//!
//! 1. Interrupted uploads: files still `uploading`. A recorded, unexpired
//!    remote handle means the bytes arrived; the import is submitted and the
//!    file moves on to `processing`. Anything else is reset.
//! 2. Unresolved operations: each is polled briefly. Finished imports are
//!    recorded, failed ones reset their file, running ones are left for the
//!    orchestrator's poll phase.
//! 3. Expiration deadlines: in-flight files whose remote handle already
//!    expired are reset; those close to expiry are reported.
//!
//! Errors on one file are collected and the pass moves on. The overall
//! deadline is fatal, as is losing the writer lock: recovery only runs while
//! this instance is the single writer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;

use super::error::{RecoveryError, StateError};
use super::state::{FileRecord, OperationRecord, StateManager};
use super::writer_lock::WriterLock;
use crate::remote::{DocumentIndex, OperationStatus, RemoteError, StoreHandle};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Deadline for the whole pass.
    pub timeout: Duration,
    /// How long each unresolved operation is polled.
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    /// Files expiring within this window are reported as deadline-critical.
    pub danger_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4 * 60 * 60),
            poll_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            danger_window: Duration::from_secs(8 * 60 * 60),
        }
    }
}

/// A file whose remote handle expires soon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlineWarning {
    pub path: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub remaining: Duration,
}

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Unresolved operations found finished and recorded.
    pub recovered_operations: u32,
    /// Interrupted uploads advanced to `processing`.
    pub recovered_uploads: u32,
    /// Files returned to pending. Includes `expired_files`.
    pub resets: u32,
    pub expired_files: u32,
    pub deadline_critical: Vec<DeadlineWarning>,
    /// Operations still running remotely.
    pub still_pending: u32,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    /// Whether the pass changed any state.
    pub fn changed_anything(&self) -> bool {
        self.recovered_operations > 0 || self.recovered_uploads > 0 || self.resets > 0
    }

    fn error(&mut self, path: &str, err: impl std::fmt::Display) {
        log::error!("Recovery of {} failed: {}", path, err);
        self.errors.push(format!("{}: {}", path, err));
    }
}

enum PollOutcome {
    Finished(OperationStatus),
    StillRunning,
    Failed(RemoteError),
}

/// Reconciles durable state with the remote index before new work starts.
pub struct RecoveryManager {
    state: StateManager,
    index: Arc<dyn DocumentIndex>,
    store: StoreHandle,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        state: StateManager,
        index: Arc<dyn DocumentIndex>,
        store: StoreHandle,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            state,
            index,
            store,
            config,
        }
    }

    /// Runs all three phases under a freshly acquired writer lock.
    ///
    /// Refuses with `LockHeld` while another instance holds the lock, so a
    /// live upload's in-flight files are never reset underneath it.
    pub async fn run(&self) -> Result<RecoveryReport, RecoveryError> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let Some(lock) = WriterLock::acquire(&self.state, instance_id)? else {
            let holder = WriterLock::holder(&self.state)?;
            log::error!("Upload lock is held by {:?}; refusing to recover", holder);
            return Err(RecoveryError::LockHeld { holder });
        };
        self.run_locked(&lock).await
    }

    /// Runs all three phases under a lock the caller already holds.
    /// Exceeding the overall timeout is fatal.
    pub async fn run_locked(&self, lock: &WriterLock) -> Result<RecoveryReport, RecoveryError> {
        let span = tracing::info_span!("recovery", store = %self.store.name);
        match tokio::time::timeout(self.config.timeout, self.run_phases(lock).instrument(span))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                log::error!(
                    "Recovery exceeded its {:?} deadline; refusing to continue",
                    self.config.timeout
                );
                Err(RecoveryError::Timeout(self.config.timeout))
            }
        }
    }

    async fn run_phases(&self, lock: &WriterLock) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();

        keep_lock(lock)?;
        self.recover_interrupted_uploads(lock, &mut report).await?;
        self.recover_pending_operations(lock, &mut report).await?;
        keep_lock(lock)?;
        self.check_expiration_deadlines(&mut report)?;

        log::info!(
            "Recovery finished: {} operations recovered, {} uploads recovered, {} resets ({} expired), {} still pending, {} deadline-critical, {} errors",
            report.recovered_operations,
            report.recovered_uploads,
            report.resets,
            report.expired_files,
            report.still_pending,
            report.deadline_critical.len(),
            report.errors.len()
        );
        Ok(report)
    }

    async fn recover_interrupted_uploads(
        &self,
        lock: &WriterLock,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let files = self.state.get_uploading_files()?;
        if !files.is_empty() {
            log::info!("Recovering {} interrupted uploads", files.len());
        }
        for file in files {
            keep_lock(lock)?;
            if let Err(e) = self.recover_upload(&file, report).await {
                report.error(&file.path, e);
            }
        }
        Ok(())
    }

    async fn recover_upload(
        &self,
        file: &FileRecord,
        report: &mut RecoveryReport,
    ) -> Result<(), StateError> {
        let Some(file_id) = file.remote_file_id.as_deref() else {
            log::info!("{} never finished uploading; resetting", file.path);
            self.state
                .reset_to_pending(&file.path, "upload interrupted before completion")?;
            report.resets += 1;
            return Ok(());
        };

        if file.remote_expiration.is_some_and(|e| e <= Utc::now()) {
            log::info!("{} was uploaded but its handle expired; resetting", file.path);
            self.state
                .reset_to_pending(&file.path, "remote file expired before import")?;
            report.resets += 1;
            report.expired_files += 1;
            return Ok(());
        }

        match self.index.import_file(&self.store, file_id).await {
            Ok(operation) => {
                self.state.mark_recovered_upload(&file.path, &operation)?;
                log::info!(
                    "{} was uploaded before the interruption; import {} submitted",
                    file.path,
                    operation
                );
                report.recovered_uploads += 1;
            }
            Err(e) => {
                self.state
                    .reset_to_pending(&file.path, &format!("import after recovery failed: {}", e))?;
                report.resets += 1;
                report.error(&file.path, e);
            }
        }
        Ok(())
    }

    async fn recover_pending_operations(
        &self,
        lock: &WriterLock,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let operations = self.state.get_pending_operations()?;
        if !operations.is_empty() {
            log::info!("Checking {} unresolved operations", operations.len());
        }
        for operation in operations {
            keep_lock(lock)?;
            if let Err(e) = self.recover_operation(&operation, report).await {
                report.error(&operation.file_path, e);
            }
        }
        Ok(())
    }

    async fn recover_operation(
        &self,
        operation: &OperationRecord,
        report: &mut RecoveryReport,
    ) -> Result<(), StateError> {
        match self.poll_briefly(&operation.name).await {
            PollOutcome::Finished(OperationStatus::Succeeded { document_id }) => {
                self.state.record_import_success(
                    &operation.file_path,
                    &operation.name,
                    document_id.as_deref(),
                )?;
                report.recovered_operations += 1;
            }
            PollOutcome::Finished(OperationStatus::Failed { message }) => {
                log::warn!(
                    "Import {} for {} failed remotely: {}",
                    operation.name,
                    operation.file_path,
                    message
                );
                self.state
                    .reset_to_pending(&operation.file_path, &format!("import failed: {}", message))?;
                report.resets += 1;
            }
            PollOutcome::Finished(OperationStatus::Running) | PollOutcome::StillRunning => {
                report.still_pending += 1;
            }
            PollOutcome::Failed(e) if e.is_rate_limit() => {
                log::warn!("Rate limited while polling {}; leaving it pending", operation.name);
                report.still_pending += 1;
            }
            PollOutcome::Failed(e) => {
                log::warn!(
                    "Polling {} for {} failed: {}",
                    operation.name,
                    operation.file_path,
                    e
                );
                self.state
                    .reset_to_pending(&operation.file_path, &format!("operation lost: {}", e))?;
                report.resets += 1;
            }
        }
        Ok(())
    }

    async fn poll_briefly(&self, name: &str) -> PollOutcome {
        let poll = async {
            loop {
                match self.index.get_operation(name).await {
                    Ok(status) if status.is_done() => return PollOutcome::Finished(status),
                    Ok(_) => tokio::time::sleep(self.config.poll_interval).await,
                    Err(e) => return PollOutcome::Failed(e),
                }
            }
        };
        tokio::time::timeout(self.config.poll_timeout, poll)
            .await
            .unwrap_or(PollOutcome::StillRunning)
    }

    fn check_expiration_deadlines(&self, report: &mut RecoveryReport) -> Result<(), StateError> {
        let now = Utc::now();
        for file in self.state.get_files_with_expiration()? {
            let Some(expires_at) = file.remote_expiration else {
                continue;
            };
            match (expires_at - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => {
                    if remaining <= self.config.danger_window {
                        log::warn!(
                            "{} expires remotely in {}m; it must finish importing before then",
                            file.path,
                            remaining.as_secs() / 60
                        );
                        report.deadline_critical.push(DeadlineWarning {
                            path: file.path.clone(),
                            expires_at,
                            remaining,
                        });
                    }
                }
                _ => {
                    log::info!("{} expired remotely at {}; resetting", file.path, expires_at);
                    match self
                        .state
                        .reset_to_pending(&file.path, "remote file expired")
                    {
                        Ok(_) => {
                            report.resets += 1;
                            report.expired_files += 1;
                        }
                        Err(e) => report.error(&file.path, e),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Refreshes the lease before the next write; a lost lock ends the pass.
fn keep_lock(lock: &WriterLock) -> Result<(), RecoveryError> {
    if lock.heartbeat()? {
        Ok(())
    } else {
        log::error!("Upload lock held by {} was taken over; stopping recovery", lock.instance_id());
        Err(RecoveryError::LockLost)
    }
}
