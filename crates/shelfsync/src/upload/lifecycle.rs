//! Per-file upload lifecycle.
//!
//! The legal edges live in a single table; the machine itself only checks
//! an edge against the table and never persists anything. Callers apply the
//! returned state and write it themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a library file with respect to the remote index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Known locally, never uploaded (or reset for a fresh upload).
    Untracked,
    /// An upload attempt was durably announced and may be in flight.
    Uploading,
    /// Uploaded; waiting for the remote import operation to finish.
    Processing,
    /// Searchable in the remote index.
    Indexed,
    /// The last attempt failed.
    Failed,
}

impl FileState {
    pub const ALL: [FileState; 5] = [
        FileState::Untracked,
        FileState::Uploading,
        FileState::Processing,
        FileState::Indexed,
        FileState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Untracked => "untracked",
            FileState::Uploading => "uploading",
            FileState::Processing => "processing",
            FileState::Indexed => "indexed",
            FileState::Failed => "failed",
        }
    }

    /// Whether a file in this state is waiting to be (re)uploaded.
    pub fn is_pending(&self) -> bool {
        matches!(self, FileState::Untracked | FileState::Failed)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| LifecycleError::UnknownState(s.to_string()))
    }
}

/// A named lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    StartUpload,
    CompleteUpload,
    CompleteProcessing,
    FailUpload,
    FailProcessing,
    Reset,
    Retry,
    FailReset,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::StartUpload => "start_upload",
            Transition::CompleteUpload => "complete_upload",
            Transition::CompleteProcessing => "complete_processing",
            Transition::FailUpload => "fail_upload",
            Transition::FailProcessing => "fail_processing",
            Transition::Reset => "reset",
            Transition::Retry => "retry",
            Transition::FailReset => "fail_reset",
        }
    }

    /// The `(from, to)` pair this edge connects.
    pub fn edge(&self) -> (FileState, FileState) {
        use FileState::*;
        match self {
            Transition::StartUpload => (Untracked, Uploading),
            Transition::CompleteUpload => (Uploading, Processing),
            Transition::CompleteProcessing => (Processing, Indexed),
            Transition::FailUpload => (Uploading, Failed),
            Transition::FailProcessing => (Processing, Failed),
            Transition::Reset => (Indexed, Untracked),
            Transition::Retry => (Failed, Untracked),
            Transition::FailReset => (Indexed, Failed),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TRANSITIONS
            .iter()
            .map(|(t, _, _)| *t)
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown transition '{}'", s))
    }
}

/// Lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition '{transition}' from state '{from}'")]
    InvalidTransition {
        from: FileState,
        transition: Transition,
    },

    #[error("Unknown lifecycle state '{0}'")]
    UnknownState(String),
}

/// The complete transition table: `(edge, from, to)`.
pub const TRANSITIONS: &[(Transition, FileState, FileState)] = &[
    (Transition::StartUpload, FileState::Untracked, FileState::Uploading),
    (Transition::CompleteUpload, FileState::Uploading, FileState::Processing),
    (Transition::CompleteProcessing, FileState::Processing, FileState::Indexed),
    (Transition::FailUpload, FileState::Uploading, FileState::Failed),
    (Transition::FailProcessing, FileState::Processing, FileState::Failed),
    (Transition::Reset, FileState::Indexed, FileState::Untracked),
    (Transition::Retry, FileState::Failed, FileState::Untracked),
    (Transition::FailReset, FileState::Indexed, FileState::Failed),
];

/// Edges that may leave `state`.
pub fn legal_transitions(state: FileState) -> Vec<Transition> {
    TRANSITIONS
        .iter()
        .filter(|(_, from, _)| *from == state)
        .map(|(t, _, _)| *t)
        .collect()
}

/// Target state of `transition` from `state`, if the edge is legal.
pub fn next_state(state: FileState, transition: Transition) -> Result<FileState, LifecycleError> {
    TRANSITIONS
        .iter()
        .find(|(t, from, _)| *t == transition && *from == state)
        .map(|(_, _, to)| *to)
        .ok_or(LifecycleError::InvalidTransition {
            from: state,
            transition,
        })
}

/// Whether `from → to` is a single legal edge.
pub fn is_legal_edge(from: FileState, to: FileState) -> bool {
    TRANSITIONS.iter().any(|(_, f, t)| *f == from && *t == to)
}

/// The legal edges that bring a record in `state` back to `untracked`.
pub fn path_to_untracked(state: FileState) -> &'static [Transition] {
    match state {
        FileState::Untracked => &[],
        FileState::Uploading => &[Transition::FailUpload, Transition::Retry],
        FileState::Processing => &[Transition::FailProcessing, Transition::Retry],
        FileState::Indexed => &[Transition::Reset],
        FileState::Failed => &[Transition::Retry],
    }
}

/// The legal edges that bring a record in `state` to `uploading`.
pub fn path_to_uploading(state: FileState) -> Result<&'static [Transition], LifecycleError> {
    match state {
        FileState::Untracked => Ok(&[Transition::StartUpload]),
        FileState::Failed => Ok(&[Transition::Retry, Transition::StartUpload]),
        other => Err(LifecycleError::InvalidTransition {
            from: other,
            transition: Transition::StartUpload,
        }),
    }
}

/// The edge that marks a record in `state` as failed, if one exists.
pub fn failure_transition(state: FileState) -> Option<Transition> {
    match state {
        FileState::Uploading => Some(Transition::FailUpload),
        FileState::Processing => Some(Transition::FailProcessing),
        FileState::Indexed => Some(Transition::FailReset),
        FileState::Untracked | FileState::Failed => None,
    }
}

/// A lifecycle machine positioned at some state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLifecycle {
    state: FileState,
}

impl FileLifecycle {
    /// Builds a machine at an arbitrary current state.
    pub fn new(state: FileState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn can(&self, transition: Transition) -> bool {
        next_state(self.state, transition).is_ok()
    }

    /// Applies `transition`. On error the machine is left untouched.
    pub fn apply(&mut self, transition: Transition) -> Result<FileState, LifecycleError> {
        let next = next_state(self.state, transition)?;
        self.state = next;
        Ok(next)
    }
}

impl Default for FileLifecycle {
    fn default() -> Self {
        Self::new(FileState::Untracked)
    }
}
