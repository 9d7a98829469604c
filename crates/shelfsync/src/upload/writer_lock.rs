//! Owned handle on the single-writer lock.
//!
//! Recovery and the orchestrator both change durable state, so both run under
//! a `WriterLock`. A caller that needs them back to back acquires one lock and
//! passes it to each; the lease is released when the handle is dropped.

use super::error::StateError;
use super::state::StateManager;

/// Holds the writer lock until dropped.
pub struct WriterLock {
    state: StateManager,
    instance_id: String,
}

impl WriterLock {
    /// Claims the lock for `instance_id`. Returns `Ok(None)` while another
    /// live instance holds it.
    pub fn acquire(
        state: &StateManager,
        instance_id: impl Into<String>,
    ) -> Result<Option<Self>, StateError> {
        let instance_id = instance_id.into();
        if !state.acquire_lock(&instance_id)? {
            return Ok(None);
        }
        Ok(Some(Self {
            state: state.clone(),
            instance_id,
        }))
    }

    /// Instance id of the current holder, if any.
    pub fn holder(state: &StateManager) -> Result<Option<String>, StateError> {
        Ok(state.lock_holder()?.map(|lock| lock.instance_id))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Extends the lease. Returns `false` once another instance took the
    /// lock over.
    pub fn heartbeat(&self) -> Result<bool, StateError> {
        self.state.heartbeat(&self.instance_id)
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = self.state.release_lock(&self.instance_id) {
            log::error!("Failed to release upload lock: {}", e);
        }
    }
}

impl std::fmt::Debug for WriterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterLock")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
