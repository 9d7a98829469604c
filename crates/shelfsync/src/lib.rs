pub mod config;
pub mod db;
pub mod error;
pub mod library;
pub mod remote;
pub mod secrets;
pub mod telemetry;
pub mod upload;

pub use config::{default_config_path, load_config, Config};
pub use db::{default_database_path, Database, DatabaseError};
pub use error::{ConfigError, Result, ScanError, ShelfsyncError};
pub use library::{scan_directory, ScanOptions, ScanReport};
pub use remote::{DocumentIndex, HttpDocumentIndex, RemoteError, StoreHandle};
pub use secrets::{resolve_secret, ApiKeySource, SecretError};
pub use telemetry::{init_logging, LogFormat};
pub use upload::{
    RecoveryManager, RecoveryReport, ShutdownController, StateManager, UploadOrchestrator,
    UploadSummary,
};
