//! Two-stage shutdown.
//!
//! The first request stops admission of new uploads and batches while
//! in-flight work finishes and is recorded. The second request asks the
//! process to exit immediately; acting on it is the caller's job.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Running,
    /// No new work is admitted; in-flight work drains.
    Draining,
    ForceExit,
}

impl ShutdownStage {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::ForceExit => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::ForceExit,
            _ => Self::Running,
        }
    }
}

/// Shared shutdown flag. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    stage: Arc<AtomicU8>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ShutdownStage {
        ShutdownStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Whether new work may still start.
    pub fn is_running(&self) -> bool {
        self.stage() == ShutdownStage::Running
    }

    /// Escalates one stage and returns the stage now in effect.
    pub fn request(&self) -> ShutdownStage {
        let previous = self
            .stage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(match ShutdownStage::from_u8(current) {
                    ShutdownStage::Running => ShutdownStage::Draining.as_u8(),
                    _ => ShutdownStage::ForceExit.as_u8(),
                })
            })
            .unwrap_or_else(|current| current);
        let now = match ShutdownStage::from_u8(previous) {
            ShutdownStage::Running => ShutdownStage::Draining,
            _ => ShutdownStage::ForceExit,
        };
        match now {
            ShutdownStage::Draining => {
                log::warn!("Shutdown requested: finishing in-flight uploads, no new work will start")
            }
            _ => log::warn!("Second shutdown request: forcing exit"),
        }
        now
    }
}
