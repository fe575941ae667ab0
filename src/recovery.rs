//! Recovery Scheduling
//!
//! Delayed background work that must never pile up: startup retries, the
//! debounced rebalance and the periodic scan for missing members.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Pending {
    id: u64,
    handle: JoinHandle<()>,
}

/// Holds at most one scheduled task
pub struct TaskSlot {
    name: &'static str,
    pending: Mutex<Option<Pending>>,
    ids: AtomicU64,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            pending: Mutex::new(None),
            ids: AtomicU64::new(1),
        })
    }

    /// Run `task` after `delay` unless something is already scheduled.
    /// Returns whether the task was scheduled.
    pub async fn schedule<F>(self: &Arc<Self>, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            tracing::trace!("{} already scheduled", self.name);
            return false;
        }

        *pending = Some(self.spawn(delay, task));
        tracing::debug!("Scheduled {} in {:?}", self.name, delay);
        true
    }

    /// Run `task` after `delay`, cancelling whatever was scheduled before
    pub async fn replace<F>(self: &Arc<Self>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.take() {
            previous.handle.abort();
        }
        *pending = Some(self.spawn(delay, task));
    }

    /// Cancel the scheduled task, if any
    pub async fn cancel(&self) -> bool {
        match self.pending.lock().await.take() {
            Some(previous) => {
                previous.handle.abort();
                tracing::debug!("Cancelled scheduled {}", self.name);
                true
            }
            None => false,
        }
    }

    fn spawn<F>(self: &Arc<Self>, delay: Duration, task: F) -> Pending
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.ids.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            slot.fired(id).await;
            task.await;
        });
        Pending { id, handle }
    }

    /// Free the slot once our delay has elapsed, so the task itself may reschedule
    async fn fired(&self, id: u64) {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }
}

/// `base` plus a random jitter of up to `jitter`
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
