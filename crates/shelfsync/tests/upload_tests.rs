//! End-to-end runs of the upload orchestrator against the scripted index.

mod common;

use std::time::Duration;

use common::{OpScript, TestHarness};
use shelfsync::remote::RemoteError;
use shelfsync::upload::{
    CircuitBreakerConfig, FileState, OperationState, ShutdownController, UploadError,
    UploadProgressKind, WriterLock,
};

const STORE: &str = common::harness::STORE;

fn rate_limited() -> RemoteError {
    RemoteError::RateLimited {
        message: "quota exceeded".to_string(),
        retry_after: None,
    }
}

fn rejected() -> RemoteError {
    RemoteError::Permanent {
        status: 400,
        message: "unsupported document".to_string(),
    }
}

#[tokio::test]
async fn test_happy_path_indexes_every_file() {
    let harness = TestHarness::new();
    let paths = harness.add_files(3);
    harness.index.set_processing_polls(2);

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.pending, 0);

    for path in &paths {
        let file = harness.file(path);
        assert_eq!(file.state, FileState::Indexed);
        assert_eq!(file.remote_doc_id.as_deref(), Some(common::fake_index::DOCUMENT_ID));
        assert!(file.remote_file_id.is_some());
        assert_eq!(file.upload_attempts, 1);
        harness.assert_history_legal(path);
    }
    assert!(harness.index.violations().is_empty(), "{:?}", harness.index.violations());
    assert!(harness.state.get_pending_files(100).unwrap().is_empty());
    assert!(harness.state.get_pending_operations().unwrap().is_empty());
}

#[tokio::test]
async fn test_second_run_has_nothing_to_do() {
    let harness = TestHarness::new();
    harness.add_files(2);

    let orchestrator = harness.orchestrator(TestHarness::fast_config());
    orchestrator.run(STORE).await.unwrap();
    let second = orchestrator.run(STORE).await.unwrap();

    assert_eq!(second.total, 0);
    assert_eq!(harness.index.uploads().len(), 2);
}

#[tokio::test]
async fn test_files_are_processed_in_batches() {
    let harness = TestHarness::new();
    harness.add_files(5);
    let config = shelfsync::upload::OrchestratorConfig {
        batch_size: 2,
        ..TestHarness::fast_config()
    };
    let orchestrator = harness.orchestrator(config);
    let mut events = orchestrator.progress().subscribe();

    let summary = orchestrator.run(STORE).await.unwrap();
    assert_eq!(summary.succeeded, 5);

    let mut batch_sizes = Vec::new();
    let mut run_completed = false;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            UploadProgressKind::BatchStarted { size, .. } => batch_sizes.push(size),
            UploadProgressKind::RunCompleted { succeeded, .. } => {
                assert_eq!(succeeded, 5);
                run_completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(batch_sizes, vec![2, 2, 1]);
    assert!(run_completed);
}

#[tokio::test]
async fn test_rate_limited_upload_fails_and_is_retried_next_run() {
    let harness = TestHarness::new();
    let path = harness.add_file("report.txt", "quarterly report");
    harness.index.fail_next_upload(rate_limited());

    let orchestrator = harness.orchestrator(TestHarness::fast_config());
    let first = orchestrator.run(STORE).await.unwrap();

    assert_eq!(first.failed, 1);
    let file = harness.file(&path);
    assert_eq!(file.state, FileState::Failed);
    assert_eq!(file.permanent_failures, 0);
    assert!(file.last_error.unwrap().contains("Rate limited"));
    assert_eq!(orchestrator.breaker().consecutive_failures(), 1);

    let second = orchestrator.run(STORE).await.unwrap();
    assert_eq!(second.succeeded, 1);
    assert_eq!(harness.file(&path).state, FileState::Indexed);
    assert_eq!(harness.index.upload_count(&path), 2);
    harness.assert_history_legal(&path);
}

#[tokio::test]
async fn test_permanent_failures_quarantine_the_file() {
    let harness = TestHarness::new();
    let path = harness.add_file("broken.txt", "broken");
    for _ in 0..3 {
        harness.index.fail_next_upload(rejected());
    }

    let orchestrator = harness.orchestrator(TestHarness::fast_config());
    for _ in 0..3 {
        let summary = orchestrator.run(STORE).await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    let file = harness.file(&path);
    assert_eq!(file.state, FileState::Failed);
    assert_eq!(file.permanent_failures, 3);

    let fourth = orchestrator.run(STORE).await.unwrap();
    assert_eq!(fourth.total, 0);
    assert_eq!(harness.index.upload_count(&path), 3);
    assert_eq!(harness.state.count_by_state().unwrap().quarantined, 1);
}

#[tokio::test]
async fn test_remote_processing_failure_is_permanent() {
    let harness = TestHarness::new();
    let path = harness.add_file("scan.txt", "unreadable");
    harness.index.set_processing_polls(1);
    harness.index.set_fail_processing(true);

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let file = harness.file(&path);
    assert_eq!(file.state, FileState::Failed);
    assert_eq!(file.permanent_failures, 1);
    assert!(harness.index.imports().is_empty());
    assert_eq!(harness.index.deleted_files().len(), 1);
}

#[tokio::test]
async fn test_failed_import_operation_fails_the_file() {
    let harness = TestHarness::new();
    let path = harness.add_file("memo.txt", "memo");
    harness.index.script_path(&path, OpScript::fail("document too large"));

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);
    let file = harness.file(&path);
    assert_eq!(file.state, FileState::Failed);
    assert!(file.last_error.unwrap().contains("document too large"));
    assert!(harness.state.get_pending_operations().unwrap().is_empty());
    harness.assert_history_legal(&path);
}

#[tokio::test]
async fn test_rejected_import_submission_fails_the_file() {
    let harness = TestHarness::new();
    let path = harness.add_file("memo.txt", "memo");
    harness.index.fail_next_import(rejected());

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(harness.file(&path).state, FileState::Failed);
    harness.assert_history_legal(&path);
}

#[tokio::test]
async fn test_rate_limited_poll_keeps_polling() {
    let harness = TestHarness::new();
    let path = harness.add_file("notes.txt", "notes");
    harness.index.script_path(
        &path,
        OpScript::succeed_after(1).preceded_by(Err(rate_limited())),
    );

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(harness.file(&path).state, FileState::Indexed);
    assert!(harness.index.operation_polls() >= 3);
}

#[tokio::test]
async fn test_poll_timeout_leaves_file_pending() {
    let harness = TestHarness::new();
    let path = harness.add_file("slow.txt", "slow");
    harness.index.script_path(&path, OpScript::running_forever());
    let config = shelfsync::upload::OrchestratorConfig {
        poll_timeout: Duration::from_millis(50),
        ..TestHarness::fast_config()
    };

    let summary = harness.orchestrator(config).run(STORE).await.unwrap();

    assert_eq!(summary.pending, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(harness.file(&path).state, FileState::Processing);

    let operations = harness.state.get_pending_operations().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].state, OperationState::Timeout);
    assert_eq!(operations[0].file_path, path);
}

#[tokio::test]
async fn test_open_breaker_skips_remaining_files() {
    let harness = TestHarness::new();
    let paths = harness.add_files(6);
    harness.index.fail_next_upload(rate_limited());
    let config = shelfsync::upload::OrchestratorConfig {
        max_upload_concurrency: 1,
        breaker: CircuitBreakerConfig {
            consecutive_threshold: 1,
            cooldown: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        },
        ..TestHarness::fast_config()
    };

    let orchestrator = harness.orchestrator(config);
    let summary = orchestrator.run(STORE).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 5);
    assert_eq!(summary.succeeded, 0);
    assert!(orchestrator.breaker().is_open());
    assert_eq!(harness.index.uploads().len(), 1);

    let untouched = paths
        .iter()
        .filter(|p| harness.file(p).state == FileState::Untracked)
        .count();
    assert_eq!(untouched, 5);
}

#[tokio::test]
async fn test_skipped_files_still_resize_the_pool() {
    let harness = TestHarness::new();
    harness.add_files(4);
    let config = shelfsync::upload::OrchestratorConfig {
        max_upload_concurrency: 10,
        breaker: CircuitBreakerConfig {
            consecutive_threshold: 1,
            cooldown: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        },
        ..TestHarness::fast_config()
    };
    let orchestrator = harness.orchestrator(config);
    orchestrator.breaker().record_429();
    assert!(orchestrator.breaker().is_open());
    let mut events = orchestrator.progress().subscribe();

    let summary = orchestrator.run(STORE).await.unwrap();

    assert_eq!(summary.skipped, 4);
    assert!(harness.index.uploads().is_empty());
    assert_eq!(orchestrator.upload_capacity(), 5);
    let mut changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UploadProgressKind::ConcurrencyChanged { from, to } = event.kind {
            changes.push((from, to));
        }
    }
    assert_eq!(changes, vec![(10, 5)]);
}

#[tokio::test]
async fn test_shutdown_before_run_skips_everything() {
    let harness = TestHarness::new();
    harness.add_files(3);
    let shutdown = ShutdownController::new();
    shutdown.request();

    let summary = harness
        .orchestrator(TestHarness::fast_config())
        .with_shutdown(shutdown)
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.skipped, 3);
    assert!(harness.index.uploads().is_empty());
}

#[tokio::test]
async fn test_shutdown_drains_current_batch() {
    let harness = TestHarness::new();
    let paths = harness.add_files(4);
    let shutdown = ShutdownController::new();
    harness.index.request_shutdown_after(1, shutdown.clone());
    let config = shelfsync::upload::OrchestratorConfig {
        batch_size: 2,
        ..TestHarness::fast_config()
    };

    let summary = harness
        .orchestrator(config)
        .with_shutdown(shutdown)
        .run(STORE)
        .await
        .unwrap();

    assert_eq!(summary.total, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.succeeded + summary.skipped, 4);
    assert!(summary.succeeded >= 1);
    assert!(summary.skipped >= 2);

    // The second batch never started.
    for path in &paths[2..] {
        assert_eq!(harness.file(path).state, FileState::Untracked);
    }
    for path in &paths[..2] {
        harness.assert_history_legal(path);
    }
}

#[tokio::test]
async fn test_held_lock_aborts_run() {
    let harness = TestHarness::new();
    harness.add_files(2);
    assert!(harness.state.acquire_lock("other-instance").unwrap());

    let result = harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await;

    match result {
        Err(UploadError::LockHeld { holder }) => {
            assert_eq!(holder.as_deref(), Some("other-instance"))
        }
        other => panic!("expected LockHeld, got {:?}", other),
    }
    assert!(harness.index.uploads().is_empty());
}

#[tokio::test]
async fn test_lock_is_released_after_run() {
    let harness = TestHarness::new();
    harness.add_files(1);

    harness
        .orchestrator(TestHarness::fast_config())
        .run(STORE)
        .await
        .unwrap();

    assert!(harness.state.lock_holder().unwrap().is_none());
    assert!(harness.state.acquire_lock("next-instance").unwrap());
}

#[tokio::test]
async fn test_recovery_and_run_share_one_lock() {
    let harness = TestHarness::new();
    let interrupted = harness.add_file("interrupted.txt", "interrupted");
    let fresh = harness.add_file("fresh.txt", "fresh");
    harness.seed_interrupted_upload(&interrupted);

    let orchestrator = harness.orchestrator(TestHarness::fast_config());
    let lock = WriterLock::acquire(&harness.state, orchestrator.instance_id())
        .unwrap()
        .unwrap();

    let report = harness
        .recovery(TestHarness::fast_recovery_config())
        .run_locked(&lock)
        .await
        .unwrap();
    assert_eq!(report.resets, 1);
    // Nobody can slip in between recovery and the run.
    assert!(!harness.state.acquire_lock("other-instance").unwrap());

    let summary = orchestrator.run_locked(STORE, &lock).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(harness.file(&interrupted).state, FileState::Indexed);
    assert_eq!(harness.file(&fresh).state, FileState::Indexed);
    assert_eq!(
        WriterLock::holder(&harness.state).unwrap().as_deref(),
        Some(orchestrator.instance_id())
    );

    drop(lock);
    assert!(harness.state.lock_holder().unwrap().is_none());
}

#[tokio::test]
async fn test_run_with_lost_lock_uploads_nothing() {
    let harness = TestHarness::new();
    harness.add_files(2);

    let lock = WriterLock::acquire(&harness.state, "instance-a").unwrap().unwrap();
    assert!(harness.state.release_lock("instance-a").unwrap());
    assert!(harness.state.acquire_lock("instance-b").unwrap());

    let result = harness
        .orchestrator(TestHarness::fast_config())
        .run_locked(STORE, &lock)
        .await;

    assert!(matches!(result, Err(UploadError::LockLost)));
    assert!(harness.index.uploads().is_empty());
}

#[tokio::test]
async fn test_max_files_limits_the_run() {
    let harness = TestHarness::new();
    harness.add_files(5);
    let config = shelfsync::upload::OrchestratorConfig {
        max_files: 2,
        ..TestHarness::fast_config()
    };

    let summary = harness.orchestrator(config).run(STORE).await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(harness.state.get_pending_files(100).unwrap().len(), 3);
}
