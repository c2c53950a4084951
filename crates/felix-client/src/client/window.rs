// Pending window: bounds unacknowledged publishes with a semaphore.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::PublishError;

/// One consumed window slot. Dropping it frees the slot.
pub type WindowSlot = OwnedSemaphorePermit;

/// Bounds the number of in-flight publishes.
///
/// Each accepted publish holds exactly one [`WindowSlot`] until its outcome is
/// resolved. The slot lives inside the pending entry, so removal of the entry
/// is the only way to free it.
#[derive(Debug)]
pub struct PendingWindow {
    slots: Arc<Semaphore>,
    max_pending: usize,
}

impl PendingWindow {
    pub fn new(max_pending: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_pending)),
            max_pending,
        }
    }

    /// Waits up to `wait` for a free slot.
    pub async fn acquire(&self, wait: Duration) -> Result<WindowSlot, PublishError> {
        match self.slots.clone().try_acquire_owned() {
            Ok(slot) => return Ok(slot),
            Err(TryAcquireError::Closed) => return Err(PublishError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }
        tracing::trace!(max_pending = self.max_pending, "pending window full");
        match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(PublishError::Closed),
            Err(_) => Err(PublishError::BackpressureTimeout {
                max_pending: self.max_pending,
                waited: wait,
            }),
        }
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<WindowSlot> {
        self.slots.clone().try_acquire_owned().ok()
    }

    pub fn in_flight(&self) -> usize {
        self.max_pending.saturating_sub(self.slots.available_permits())
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Fails current and future waiters with `Closed`. Held slots stay valid.
    pub(crate) fn close(&self) {
        self.slots.close();
    }
}
