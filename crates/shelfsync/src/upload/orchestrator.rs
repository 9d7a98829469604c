//! Top-level upload driver.
//!
//! A run takes the writer lock, loads pending files and pushes them through
//! the remote index in fixed-size batches. Each batch runs its upload phase
//! and then its poll phase to completion before the next batch starts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::Instrument;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::error::{Result, StateError, UploadError};
use super::permits::PermitPool;
use super::progress::{UploadProgressBroadcaster, UploadProgressKind};
use super::rate_limiter::{AdaptiveRateLimiter, ThroughputTier};
use super::shutdown::ShutdownController;
use super::state::{BatchStatus, FailureKind, FileRecord, OperationState, StateManager};
use super::writer_lock::WriterLock;
use crate::remote::{DocumentIndex, FileStatus, OperationStatus, RemoteError, RemoteFile, StoreHandle};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    /// Upper bound of the upload pool. The breaker may lower it.
    pub max_upload_concurrency: usize,
    pub poll_concurrency: usize,
    pub poll_interval: Duration,
    /// How long one import operation is polled before it is left pending.
    pub poll_timeout: Duration,
    /// How long an uploaded file may stay `PROCESSING` before import.
    pub file_active_timeout: Duration,
    /// Most pending files loaded per run.
    pub max_files: u64,
    pub tier: ThroughputTier,
    pub breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_upload_concurrency: 5,
            poll_concurrency: 20,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(10 * 60),
            file_active_timeout: Duration::from_secs(120),
            max_files: i64::MAX as u64,
            tier: ThroughputTier::Tier1,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Outcome counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub total: usize,
    /// Indexed during this run.
    pub succeeded: usize,
    pub failed: usize,
    /// Not attempted: breaker open or shutdown requested.
    pub skipped: usize,
    /// Uploaded, but the import was still running when polling gave up.
    pub pending: usize,
}

impl UploadSummary {
    fn absorb(&mut self, batch: &BatchTally) {
        self.succeeded += batch.succeeded;
        self.failed += batch.failed;
        self.skipped += batch.skipped;
        self.pending += batch.pending;
    }
}

#[derive(Debug, Default)]
struct BatchTally {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    pending: usize,
}

#[derive(Debug)]
enum UploadOutcome {
    Uploaded { path: String, operation: String },
    Failed,
    RateLimited,
    Skipped,
}

#[derive(Debug)]
enum PollResult {
    Indexed,
    Failed,
    Pending,
}

/// Drives pending files through upload, import and polling.
pub struct UploadOrchestrator {
    state: StateManager,
    index: Arc<dyn DocumentIndex>,
    breaker: Arc<CircuitBreaker>,
    limiter: AdaptiveRateLimiter,
    upload_pool: PermitPool,
    poll_pool: PermitPool,
    shutdown: ShutdownController,
    progress: UploadProgressBroadcaster,
    config: OrchestratorConfig,
    instance_id: String,
}

impl UploadOrchestrator {
    pub fn new(state: StateManager, index: Arc<dyn DocumentIndex>, config: OrchestratorConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let limiter = AdaptiveRateLimiter::new(config.tier, Arc::clone(&breaker));
        Self {
            upload_pool: PermitPool::new(config.max_upload_concurrency),
            poll_pool: PermitPool::new(config.poll_concurrency),
            state,
            index,
            breaker,
            limiter,
            shutdown: ShutdownController::new(),
            progress: UploadProgressBroadcaster::default(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Shares a shutdown flag with a signal handler.
    pub fn with_shutdown(mut self, shutdown: ShutdownController) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_progress(mut self, progress: UploadProgressBroadcaster) -> Self {
        self.progress = progress;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn progress(&self) -> &UploadProgressBroadcaster {
        &self.progress
    }

    pub fn shutdown(&self) -> &ShutdownController {
        &self.shutdown
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn upload_capacity(&self) -> usize {
        self.upload_pool.capacity()
    }

    /// Uploads every pending file into the store named `destination`.
    ///
    /// Takes the writer lock for the duration of the run and aborts with
    /// `LockHeld` while another instance holds it.
    pub async fn run(&self, destination: &str) -> Result<UploadSummary> {
        let Some(lock) = WriterLock::acquire(&self.state, self.instance_id.as_str())? else {
            let holder = WriterLock::holder(&self.state)?;
            log::error!("Upload lock is held by {:?}; aborting run", holder);
            return Err(UploadError::LockHeld { holder });
        };
        self.run_locked(destination, &lock).await
    }

    /// Like [`run`](Self::run), under a lock the caller already holds.
    pub async fn run_locked(&self, destination: &str, lock: &WriterLock) -> Result<UploadSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("upload_run", run_id = %run_id, destination);
        self.run_inner(&run_id, destination, lock).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: &str,
        destination: &str,
        lock: &WriterLock,
    ) -> Result<UploadSummary> {
        if !lock.heartbeat()? {
            return Err(UploadError::LockLost);
        }
        let store = self.index.ensure_store(destination).await?;

        let files = self.state.get_pending_files(self.config.max_files)?;
        let mut summary = UploadSummary {
            total: files.len(),
            ..UploadSummary::default()
        };
        log::info!(
            "Uploading {} pending files to '{}' in batches of {}",
            files.len(),
            store.display_name,
            self.config.batch_size
        );

        let batch_size = self.config.batch_size.max(1);
        for (index, chunk) in files.chunks(batch_size).enumerate() {
            let number = index as u32 + 1;
            if !self.shutdown.is_running() {
                let remaining = files.len() - index * batch_size;
                log::warn!("Shutdown requested; skipping {} files not yet started", remaining);
                summary.skipped += remaining;
                break;
            }
            if index > 0 && !lock.heartbeat()? {
                let remaining = files.len() - index * batch_size;
                log::error!("Upload lock was lost; skipping {} files", remaining);
                summary.skipped += remaining;
                break;
            }

            let span = tracing::info_span!("batch", number, size = chunk.len());
            let tally = self
                .process_batch(run_id, number, chunk, &store)
                .instrument(span)
                .await?;
            summary.absorb(&tally);
        }

        log::info!(
            "Run finished: {} total, {} succeeded, {} failed, {} skipped, {} pending",
            summary.total,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.pending
        );
        self.progress.emit(
            run_id,
            UploadProgressKind::RunCompleted {
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
                skipped: summary.skipped,
                pending: summary.pending,
            },
        );
        Ok(summary)
    }

    async fn process_batch(
        &self,
        run_id: &str,
        number: u32,
        files: &[FileRecord],
        store: &StoreHandle,
    ) -> std::result::Result<BatchTally, StateError> {
        let batch_id = self.state.start_batch(run_id, number, files.len() as u32)?;
        self.progress.emit(
            run_id,
            UploadProgressKind::BatchStarted {
                number,
                size: files.len(),
            },
        );
        log::info!("Batch {} started with {} files", number, files.len());

        let uploads = join_all(
            files
                .iter()
                .map(|file| self.upload_single_file(run_id, file, store)),
        )
        .await;

        let mut tally = BatchTally::default();
        let mut to_poll = Vec::new();
        for outcome in uploads {
            match outcome {
                UploadOutcome::Uploaded { path, operation } => to_poll.push((path, operation)),
                UploadOutcome::Failed | UploadOutcome::RateLimited => tally.failed += 1,
                UploadOutcome::Skipped => tally.skipped += 1,
            }
        }

        let polls = join_all(
            to_poll
                .iter()
                .map(|(path, operation)| self.poll_single_operation(run_id, path, operation)),
        )
        .await;
        for result in polls {
            match result {
                PollResult::Indexed => tally.succeeded += 1,
                PollResult::Failed => tally.failed += 1,
                PollResult::Pending => tally.pending += 1,
            }
        }

        let status = if self.shutdown.is_running() {
            BatchStatus::Completed
        } else {
            BatchStatus::Interrupted
        };
        self.state.finish_batch(
            batch_id,
            tally.succeeded as u32,
            tally.failed as u32,
            status,
        )?;
        self.progress.emit(
            run_id,
            UploadProgressKind::BatchCompleted {
                number,
                succeeded: tally.succeeded as u32,
                failed: tally.failed as u32,
            },
        );
        log::info!(
            "Batch {} {}: {} indexed, {} failed, {} skipped, {} pending",
            number,
            status.as_str(),
            tally.succeeded,
            tally.failed,
            tally.skipped,
            tally.pending
        );
        Ok(tally)
    }

    /// Uploads one file and submits its import. Never returns an error:
    /// every failure is recorded against the file and counted. The pool is
    /// resized to the breaker's recommendation after every file, skipped or
    /// not.
    async fn upload_single_file(
        &self,
        run_id: &str,
        file: &FileRecord,
        store: &StoreHandle,
    ) -> UploadOutcome {
        let _permit = self.upload_pool.acquire().await;
        let outcome = self.attempt_upload(run_id, file, store).await;
        self.adjust_concurrency(run_id);
        outcome
    }

    async fn attempt_upload(
        &self,
        run_id: &str,
        file: &FileRecord,
        store: &StoreHandle,
    ) -> UploadOutcome {
        if !self.shutdown.is_running() {
            return self.skip(run_id, file, "shutdown requested");
        }
        if self.breaker.is_open() {
            return self.skip(run_id, file, "circuit breaker open");
        }

        self.limiter.wait_if_needed().await;

        // The intent must be durable before the remote sees the file.
        if let Err(e) = self.state.record_upload_intent(&file.path) {
            return self.state_failure(run_id, &file.path, e);
        }

        self.upload_and_import(run_id, file, store).await
    }

    async fn upload_and_import(
        &self,
        run_id: &str,
        file: &FileRecord,
        store: &StoreHandle,
    ) -> UploadOutcome {
        let uploaded = match self
            .index
            .upload_file(Path::new(&file.path), &file.filename, file.mime_type.as_deref())
            .await
        {
            Ok(uploaded) => uploaded,
            Err(e) => return self.remote_failure(run_id, &file.path, e),
        };
        self.observe_quota();

        if let Err(e) = self.state.record_remote_file(
            &file.path,
            &uploaded.name,
            &uploaded.uri,
            uploaded.expiration,
        ) {
            return self.state_failure(run_id, &file.path, e);
        }

        let uploaded_name = uploaded.name.clone();
        let active = match self.wait_until_active(uploaded).await {
            Ok(active) => active,
            Err(e) => {
                self.discard_remote_file(&uploaded_name).await;
                return self.remote_failure(run_id, &file.path, e);
            }
        };

        self.limiter.wait_if_needed().await;
        let operation = match self.index.import_file(store, &active.name).await {
            Ok(operation) => operation,
            Err(e) => {
                if !e.is_rate_limit() {
                    self.discard_remote_file(&active.name).await;
                }
                return self.remote_failure(run_id, &file.path, e);
            }
        };
        self.observe_quota();

        if let Err(e) =
            self.state
                .record_upload_success(&file.path, &active.uri, &active.name, &operation)
        {
            return self.state_failure(run_id, &file.path, e);
        }

        self.breaker.record_success();
        log::debug!("{} uploaded, import {} submitted", file.path, operation);
        self.progress.emit(
            run_id,
            UploadProgressKind::FileUploaded {
                path: file.path.clone(),
                operation: operation.clone(),
            },
        );
        UploadOutcome::Uploaded {
            path: file.path.clone(),
            operation,
        }
    }

    /// Best-effort removal of an uploaded handle that will never be imported.
    async fn discard_remote_file(&self, name: &str) {
        if let Err(e) = self.index.delete_file(name).await {
            log::debug!("Could not delete orphaned remote file {}: {}", name, e);
        }
    }

    /// Waits, bounded, for the remote to finish ingesting an uploaded file.
    async fn wait_until_active(&self, file: RemoteFile) -> std::result::Result<RemoteFile, RemoteError> {
        if file.status == FileStatus::Active {
            return Ok(file);
        }
        let name = file.name.clone();
        let wait = async {
            let mut current = file;
            loop {
                match current.status {
                    FileStatus::Active => return Ok(current),
                    FileStatus::Failed => {
                        return Err(RemoteError::Permanent {
                            status: 422,
                            message: format!("remote processing of {} failed", current.name),
                        })
                    }
                    FileStatus::Processing | FileStatus::Unknown => {
                        tokio::time::sleep(self.config.poll_interval).await;
                        current = match self.index.get_file(&current.name).await {
                            Ok(next) => next,
                            Err(e) => return Err(e),
                        };
                    }
                }
            }
        };
        tokio::time::timeout(self.config.file_active_timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::Transient(format!(
                    "{} not active after {:?}",
                    name, self.config.file_active_timeout
                )))
            })
    }

    /// Polls one import operation to a final outcome, bounded by the poll
    /// timeout.
    async fn poll_single_operation(&self, run_id: &str, path: &str, operation: &str) -> PollResult {
        let _permit = self.poll_pool.acquire().await;

        let poll = async {
            loop {
                match self.index.get_operation(operation).await {
                    Ok(status) if status.is_done() => return Ok(status),
                    Ok(_) => tokio::time::sleep(self.config.poll_interval).await,
                    Err(e) if e.is_rate_limit() => {
                        self.breaker.record_429();
                        let delay = self.limiter.current_delay().max(self.config.poll_interval);
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(self.config.poll_timeout, poll).await {
            Ok(Ok(OperationStatus::Succeeded { document_id })) => {
                match self
                    .state
                    .record_import_success(path, operation, document_id.as_deref())
                {
                    Ok(()) => {
                        self.progress.emit(
                            run_id,
                            UploadProgressKind::FileIndexed {
                                path: path.to_string(),
                            },
                        );
                        PollResult::Indexed
                    }
                    Err(e) => {
                        log::error!("Failed to record import of {}: {}", path, e);
                        PollResult::Failed
                    }
                }
            }
            Ok(Ok(OperationStatus::Failed { message })) => {
                self.import_failure(run_id, path, operation, &message)
            }
            Ok(Ok(OperationStatus::Running)) => PollResult::Pending,
            Ok(Err(e)) => self.import_failure(run_id, path, operation, &e.to_string()),
            Err(_) => {
                log::warn!(
                    "Import {} for {} still running after {:?}; leaving it pending",
                    operation,
                    path,
                    self.config.poll_timeout
                );
                if let Err(e) = self.state.update_operation_state(
                    operation,
                    OperationState::Timeout,
                    Some("poll timed out"),
                ) {
                    log::error!("Failed to record poll timeout of {}: {}", operation, e);
                }
                PollResult::Pending
            }
        }
    }

    fn import_failure(&self, run_id: &str, path: &str, operation: &str, message: &str) -> PollResult {
        log::warn!("Import of {} failed: {}", path, message);
        if let Err(e) = self.state.record_import_failure(path, operation, message) {
            log::error!("Failed to record import failure of {}: {}", path, e);
        }
        self.progress.emit(
            run_id,
            UploadProgressKind::FileFailed {
                path: path.to_string(),
                error: message.to_string(),
            },
        );
        PollResult::Failed
    }

    fn skip(&self, run_id: &str, file: &FileRecord, reason: &str) -> UploadOutcome {
        log::debug!("Skipping {}: {}", file.path, reason);
        self.progress.emit(
            run_id,
            UploadProgressKind::FileSkipped {
                path: file.path.clone(),
                reason: reason.to_string(),
            },
        );
        UploadOutcome::Skipped
    }

    /// Records a remote failure against the file and feeds the breaker.
    /// Rate limits are not retried here; the next run picks the file up.
    fn remote_failure(&self, run_id: &str, path: &str, err: RemoteError) -> UploadOutcome {
        let (kind, outcome) = if err.is_rate_limit() {
            self.breaker.record_429();
            (FailureKind::RateLimited, UploadOutcome::RateLimited)
        } else {
            self.breaker.record_error();
            let kind = if err.is_permanent() {
                FailureKind::Permanent
            } else {
                FailureKind::Transient
            };
            (kind, UploadOutcome::Failed)
        };

        log::warn!("Upload of {} failed: {}", path, err);
        if let Err(e) = self.state.record_upload_failure(path, &err.to_string(), kind) {
            log::error!("Failed to record upload failure of {}: {}", path, e);
        }

        let event = match outcome {
            UploadOutcome::RateLimited => UploadProgressKind::FileRateLimited {
                path: path.to_string(),
            },
            _ => UploadProgressKind::FileFailed {
                path: path.to_string(),
                error: err.to_string(),
            },
        };
        self.progress.emit(run_id, event);
        outcome
    }

    fn state_failure(&self, run_id: &str, path: &str, err: StateError) -> UploadOutcome {
        log::error!("Could not record upload state of {}: {}", path, err);
        self.progress.emit(
            run_id,
            UploadProgressKind::FileFailed {
                path: path.to_string(),
                error: err.to_string(),
            },
        );
        UploadOutcome::Failed
    }

    fn observe_quota(&self) {
        let headers = self.index.quota_headers();
        self.limiter
            .observe_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    /// Resizes the upload pool to the breaker's recommendation. Permits
    /// already held are unaffected.
    fn adjust_concurrency(&self, run_id: &str) {
        let recommended = self
            .breaker
            .get_recommended_concurrency(self.config.max_upload_concurrency);
        let current = self.upload_pool.capacity();
        if recommended != current {
            self.upload_pool.set_capacity(recommended);
            log::info!("Upload concurrency {} -> {}", current, recommended);
            self.progress.emit(
                run_id,
                UploadProgressKind::ConcurrencyChanged {
                    from: current,
                    to: recommended,
                },
            );
        }
    }
}
