//! Upload progress broadcaster for live display.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadProgressKind {
    BatchStarted {
        number: u32,
        size: usize,
    },
    BatchCompleted {
        number: u32,
        succeeded: u32,
        failed: u32,
    },
    /// Upload and import submission finished; the import is being polled.
    FileUploaded {
        path: String,
        operation: String,
    },
    FileIndexed {
        path: String,
    },
    FileFailed {
        path: String,
        error: String,
    },
    FileRateLimited {
        path: String,
    },
    /// Not attempted: breaker open or shutdown requested.
    FileSkipped {
        path: String,
        reason: String,
    },
    ConcurrencyChanged {
        from: usize,
        to: usize,
    },
    RunCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        pending: usize,
    },
}

/// A timestamped progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub kind: UploadProgressKind,
    pub timestamp: DateTime<Utc>,
}

/// Broadcasts upload progress events. Sending never fails; events are
/// dropped when nobody listens.
#[derive(Clone)]
pub struct UploadProgressBroadcaster {
    sender: Arc<broadcast::Sender<UploadProgressEvent>>,
}

impl UploadProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, run_id: &str, kind: UploadProgressKind) {
        let _ = self.sender.send(UploadProgressEvent {
            run_id: run_id.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for UploadProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
