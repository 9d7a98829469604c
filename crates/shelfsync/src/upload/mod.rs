//! Upload resilience engine.
//!
//! Drives library files through the remote index's upload, import and poll
//! protocol, records every step durably, and reconciles interrupted work on
//! startup.

pub mod circuit_breaker;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod permits;
pub mod progress;
pub mod rate_limiter;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod writer_lock;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{RecoveryError, StateError, UploadError};
pub use lifecycle::{FileLifecycle, FileState, LifecycleError, Transition};
pub use orchestrator::{OrchestratorConfig, UploadOrchestrator, UploadSummary};
pub use permits::{PermitPool, PoolPermit};
pub use progress::{UploadProgressBroadcaster, UploadProgressEvent, UploadProgressKind};
pub use rate_limiter::{AdaptiveRateLimiter, ThroughputTier};
pub use recovery::{DeadlineWarning, RecoveryConfig, RecoveryManager, RecoveryReport};
pub use shutdown::{ShutdownController, ShutdownStage};
pub use state::{
    FailureKind, FileRecord, NewFile, OperationRecord, OperationState, Registration,
    StateCounts, StateManager,
};
pub use writer_lock::WriterLock;
