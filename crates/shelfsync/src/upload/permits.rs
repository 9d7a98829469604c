//! Permit pool whose capacity can change while permits are held.
//!
//! Resizing only affects future acquisitions: holders keep their permits,
//! and a shrunk pool simply admits nobody new until enough permits return.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded concurrency pool with an adjustable capacity.
#[derive(Debug, Clone)]
pub struct PermitPool {
    shared: Arc<Shared>,
}

/// A held slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct PoolPermit {
    shared: Arc<Shared>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.shared.notify.notify_waiters();
    }
}

impl PermitPool {
    /// Creates a pool. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    capacity: capacity.max(1),
                    in_use: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use
    }

    /// Changes the capacity for future acquisitions. Returns the previous
    /// capacity.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let previous = {
            let mut state = self.shared.lock();
            std::mem::replace(&mut state.capacity, capacity.max(1))
        };
        self.shared.notify.notify_waiters();
        previous
    }

    /// Takes a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        let mut state = self.shared.lock();
        if state.in_use < state.capacity {
            state.in_use += 1;
            Some(PoolPermit {
                shared: Arc::clone(&self.shared),
            })
        } else {
            None
        }
    }

    /// Waits until a permit is free and takes it.
    pub async fn acquire(&self) -> PoolPermit {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release between the
            // check and the await is not missed.
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }
}
