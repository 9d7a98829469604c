use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use shelfsync::secrets::expand_home;
use shelfsync::upload::{
    RecoveryReport, ShutdownStage, UploadError, UploadProgressEvent, UploadProgressKind, WriterLock,
};
use shelfsync::{
    default_config_path, default_database_path, init_logging, load_config, scan_directory,
    Config, ConfigError, Database, DocumentIndex, HttpDocumentIndex, LogFormat, RecoveryManager,
    ScanOptions, ShelfsyncError, ShutdownController, StateManager, UploadOrchestrator,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "shelfsync", version, about = "Upload a document library into a search index")]
struct Cli {
    /// Config file. Defaults to ~/.shelfsync/config.json when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite state database.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register new and changed files under a directory.
    Scan {
        /// Library root. Defaults to library.root from the config.
        dir: Option<PathBuf>,
    },
    /// Recover interrupted work, then upload every pending file.
    Upload {
        /// Destination store display name.
        #[arg(long)]
        store: Option<String>,
    },
    /// Run only the recovery pass.
    Recover {
        #[arg(long)]
        store: Option<String>,
    },
    /// Show file counts per lifecycle state.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, ShelfsyncError> {
    let config = resolve_config(cli.config.as_deref())?;
    let db_path = resolve_db_path(cli.db, &config)?;
    let database = Database::open(&db_path)?;
    let state = StateManager::new(database)
        .with_quarantine_after(config.upload.quarantine_after)
        .with_lock_ttl(config.lock_ttl());

    match cli.command {
        Command::Scan { dir } => {
            let root = match dir.or_else(|| config.library.root.clone()) {
                Some(root) => PathBuf::from(expand_home(&root.to_string_lossy())),
                None => {
                    return Err(ConfigError::Validation {
                        message: "no directory given and library.root is not set".to_string(),
                    }
                    .into())
                }
            };
            let index = connect(&config)?;
            let options = ScanOptions::from(&config.library);
            let report = scan_directory(&state, index.as_ref(), &root, &options).await?;
            print_json(&report);
            Ok(exit_code(report.errors.is_empty()))
        }
        Command::Upload { store } => {
            let index = connect(&config)?;
            let store_name = store.unwrap_or_else(|| config.remote.store.clone());
            let handle = index.ensure_store(&store_name).await?;

            let shutdown = ShutdownController::new();
            let orchestrator =
                UploadOrchestrator::new(state.clone(), Arc::clone(&index), config.orchestrator_config())
                    .with_shutdown(shutdown.clone());

            // One lease covers recovery and the upload run that follows it.
            let Some(lock) = WriterLock::acquire(&state, orchestrator.instance_id())? else {
                let holder = WriterLock::holder(&state)?;
                return Err(UploadError::LockHeld { holder }.into());
            };
            install_signal_handler(shutdown, state.clone(), lock.instance_id().to_string());

            let report = RecoveryManager::new(state, index, handle, config.recovery_config())
                .run_locked(&lock)
                .await?;
            warn_deadlines(&report);

            let mut events = orchestrator.progress().subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => log_progress(&event),
                        Err(RecvError::Lagged(missed)) => warn!("Missed {} progress events", missed),
                        Err(RecvError::Closed) => break,
                    }
                }
            });
            let summary = orchestrator.run_locked(&store_name, &lock).await?;
            print_json(&summary);
            Ok(exit_code(summary.failed == 0))
        }
        Command::Recover { store } => {
            let index = connect(&config)?;
            let store_name = store.unwrap_or_else(|| config.remote.store.clone());
            let handle = index.ensure_store(&store_name).await?;
            let report = RecoveryManager::new(state, index, handle, config.recovery_config())
                .run()
                .await?;
            warn_deadlines(&report);
            print_json(&report);
            Ok(exit_code(report.errors.is_empty()))
        }
        Command::Status => {
            let counts = state.count_by_state()?;
            let holder = state.lock_holder()?.map(|lock| lock.instance_id);
            print_json(&serde_json::json!({
                "database": db_path.display().to_string(),
                "counts": counts,
                "total": counts.total(),
                "lock_holder": holder,
            }));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config(&path)
            } else {
                info!("No config at {}; using defaults", path.display());
                Ok(Config::default())
            }
        }
    }
}

fn resolve_db_path(explicit: Option<PathBuf>, config: &Config) -> Result<PathBuf, ConfigError> {
    explicit
        .or_else(|| config.database_path.clone())
        .map(|p| PathBuf::from(expand_home(&p.to_string_lossy())))
        .or_else(default_database_path)
        .ok_or_else(|| ConfigError::Validation {
            message: "cannot determine a database path; pass --db".to_string(),
        })
}

fn connect(config: &Config) -> Result<Arc<dyn DocumentIndex>, ShelfsyncError> {
    let api_key = config.remote.credentials.resolve()?;
    let index = HttpDocumentIndex::with_base_url(&config.remote.base_url, api_key)?;
    Ok(Arc::new(index))
}

/// First Ctrl-C drains the current batch; the second releases the writer
/// lock and exits immediately.
fn install_signal_handler(shutdown: ShutdownController, state: StateManager, instance_id: String) {
    let result = ctrlc::set_handler(move || match shutdown.request() {
        ShutdownStage::Draining => {
            warn!("Shutdown requested; finishing the current batch (Ctrl-C again to force)");
        }
        ShutdownStage::ForceExit => {
            error!("Forced exit; interrupted uploads will be recovered on the next run");
            if let Err(e) = state.release_lock(&instance_id) {
                error!("Failed to release upload lock: {}", e);
            }
            std::process::exit(130);
        }
        ShutdownStage::Running => {}
    });
    if let Err(e) = result {
        warn!("Could not install Ctrl-C handler: {}", e);
    }
}

fn log_progress(event: &UploadProgressEvent) {
    match &event.kind {
        UploadProgressKind::BatchStarted { number, size } => {
            info!("Batch {} started ({} files)", number, size)
        }
        UploadProgressKind::BatchCompleted {
            number,
            succeeded,
            failed,
        } => info!("Batch {} done: {} indexed, {} failed", number, succeeded, failed),
        UploadProgressKind::FileIndexed { path } => info!("Indexed {}", path),
        UploadProgressKind::FileFailed { path, error } => warn!("{} failed: {}", path, error),
        UploadProgressKind::FileRateLimited { path } => warn!("{} was rate limited", path),
        UploadProgressKind::ConcurrencyChanged { from, to } => {
            info!("Upload concurrency {} -> {}", from, to)
        }
        _ => {}
    }
}

fn warn_deadlines(report: &RecoveryReport) {
    for warning in &report.deadline_critical {
        warn!(
            "{} expires remotely at {} ({}m left)",
            warning.path,
            warning.expires_at,
            warning.remaining.as_secs() / 60
        );
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to render output: {}", e),
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
