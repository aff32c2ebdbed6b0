//! Pending update buffer shared by the stream ingestor and the batch writer.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::models::PendingUpdate;

/// Cloneable handle to the pending update buffer.
///
/// Appends and drains hold the lock only for a push or a `mem::take`, so
/// neither side waits on the other for longer than a pointer swap. An
/// update pushed concurrently with a drain ends up in exactly one of the
/// two buffers.
#[derive(Clone)]
pub struct UpdateBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    pending: Mutex<Vec<PendingUpdate>>,
    high_water: usize,
    wake: Notify,
}

impl UpdateBuffer {
    /// Create an empty buffer. Reaching `high_water` pending updates wakes
    /// the writer early; `0` disables early wake-ups.
    pub fn new(high_water: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Vec::new()),
                high_water,
                wake: Notify::new(),
            }),
        }
    }

    /// Append one update. Returns the number of pending updates.
    pub fn push(&self, update: PendingUpdate) -> usize {
        let len = {
            let mut pending = self.lock();
            pending.push(update);
            pending.len()
        };
        if self.inner.high_water > 0 && len == self.inner.high_water {
            self.inner.wake.notify_one();
        }
        len
    }

    /// Swap the buffer for an empty one and return what was in it.
    pub fn take(&self) -> Vec<PendingUpdate> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once the buffer has reached its high-water mark.
    pub async fn high_water_reached(&self) {
        self.inner.wake.notified().await
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingUpdate>> {
        // a panic while holding the lock cannot leave the Vec half-written
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for UpdateBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}
