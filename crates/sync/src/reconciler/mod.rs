// Backend reconciler: debounced, retried persistence of space snapshots.
//
//   Structural change (add/remove window, rename, init merge) -> save now
//   Drag-driven change -> coalesce per space, save after the drag debounce
//
// Transient failures are retried with exponential backoff. NotFound and
// other rejections surface immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deskspace_common::types::SpaceSnapshot;

use crate::backend::{BackendError, SpaceBackend};
use crate::config::PersistenceConfig;
use crate::engine::debounce::Coalescer;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Position/size updates while dragging; debounced.
    Drag,
    /// Structural changes; saved immediately.
    Structural,
}

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential backoff for a 0-based retry attempt: `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.min(7);
    base.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
}

/// PUT a snapshot, retrying transient failures up to `max_retries` times.
pub async fn save_with_retry<B: SpaceBackend>(
    backend: &B,
    space_id: &str,
    snapshot: &SpaceSnapshot,
    max_retries: u32,
    base_delay: Duration,
) -> Result<(), BackendError> {
    let mut attempt = 0;
    loop {
        match backend.put_space(space_id, snapshot).await {
            Ok(()) => {
                info!(space_id, windows = snapshot.windows.len(), attempt, "space saved");
                return Ok(());
            }
            Err(error) if error.is_retryable() && attempt < max_retries => {
                let delay = backoff_delay(attempt, base_delay);
                warn!(space_id, attempt = attempt + 1, ?delay, error = %error, "space save failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(space_id, error = %error, "space save failed");
                return Err(error);
            }
        }
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

struct SpaceSlot {
    pending: Coalescer<SpaceSnapshot>,
    wake: Arc<Notify>,
    stop: CancellationToken,
}

struct Inner<B> {
    backend: Arc<B>,
    config: PersistenceConfig,
    slots: Mutex<HashMap<String, SpaceSlot>>,
    shutdown: CancellationToken,
}

pub struct BackendReconciler<B: SpaceBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: SpaceBackend> Clone for BackendReconciler<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: SpaceBackend> BackendReconciler<B> {
    pub fn new(backend: Arc<B>, config: PersistenceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                slots: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    /// Persist `snapshot` according to `trigger`. Drag saves return as soon as
    /// the snapshot is queued; structural saves return the PUT result.
    pub async fn schedule(
        &self,
        space_id: &str,
        snapshot: SpaceSnapshot,
        trigger: SaveTrigger,
    ) -> Result<(), BackendError> {
        match trigger {
            SaveTrigger::Structural => {
                self.take_pending(space_id);
                self.save_now(space_id, &snapshot).await
            }
            SaveTrigger::Drag => {
                self.queue_save(space_id, snapshot);
                Ok(())
            }
        }
    }

    pub async fn save_now(&self, space_id: &str, snapshot: &SpaceSnapshot) -> Result<(), BackendError> {
        save_with_retry(
            self.inner.backend.as_ref(),
            space_id,
            snapshot,
            self.inner.config.max_retries,
            self.inner.config.retry_base_delay(),
        )
        .await
    }

    /// Save the pending drag snapshot for `space_id` now, if there is one.
    pub async fn flush(&self, space_id: &str) -> Result<(), BackendError> {
        match self.take_pending(space_id) {
            Some(snapshot) => self.save_now(space_id, &snapshot).await,
            None => Ok(()),
        }
    }

    pub fn has_pending(&self, space_id: &str) -> bool {
        self.inner
            .slots
            .lock()
            .map(|slots| slots.get(space_id).is_some_and(|slot| slot.pending.is_pending()))
            .unwrap_or(false)
    }

    /// Flush and stop the save worker for one space.
    pub async fn release(&self, space_id: &str) -> Result<(), BackendError> {
        let result = self.flush(space_id).await;
        let slot = self.inner.slots.lock().ok().and_then(|mut slots| slots.remove(space_id));
        if let Some(slot) = slot {
            slot.stop.cancel();
        }
        result
    }

    /// Flush every pending save and stop all workers.
    pub async fn shutdown(&self) {
        let space_ids: Vec<String> =
            self.inner.slots.lock().map(|slots| slots.keys().cloned().collect()).unwrap_or_default();
        for space_id in space_ids {
            if let Err(error) = self.release(&space_id).await {
                warn!(space_id = %space_id, error = %error, "final save failed during shutdown");
            }
        }
        self.inner.shutdown.cancel();
        info!("backend reconciler shut down");
    }

    fn take_pending(&self, space_id: &str) -> Option<SpaceSnapshot> {
        let mut slots = self.inner.slots.lock().ok()?;
        slots.get_mut(space_id).and_then(|slot| slot.pending.flush())
    }

    /// Queue a debounced save; the latest snapshot per space wins.
    pub fn queue_save(&self, space_id: &str, snapshot: SpaceSnapshot) {
        let Ok(mut slots) = self.inner.slots.lock() else {
            warn!(space_id, "save slot lock poisoned, drag save dropped");
            return;
        };
        if let Some(slot) = slots.get_mut(space_id) {
            match slot.pending.push(snapshot) {
                Some(immediate) => {
                    drop(slots);
                    let reconciler = self.clone();
                    let space_id = space_id.to_string();
                    tokio::spawn(async move {
                        let _ = reconciler.save_now(&space_id, &immediate).await;
                    });
                }
                None => slot.wake.notify_one(),
            }
            return;
        }

        let mut pending = Coalescer::new(self.inner.config.drag_save_debounce());
        let immediate = pending.push(snapshot);
        let wake = Arc::new(Notify::new());
        let stop = self.inner.shutdown.child_token();
        slots.insert(
            space_id.to_string(),
            SpaceSlot { pending, wake: Arc::clone(&wake), stop: stop.clone() },
        );
        drop(slots);

        let reconciler = self.clone();
        let space_id = space_id.to_string();
        tokio::spawn(async move {
            if let Some(snapshot) = immediate {
                let _ = reconciler.save_now(&space_id, &snapshot).await;
            }
            reconciler.run_worker(space_id, wake, stop).await;
        });
    }

    async fn run_worker(self, space_id: String, wake: Arc<Notify>, stop: CancellationToken) {
        debug!(space_id = %space_id, "save worker started");
        loop {
            let deadline = self
                .inner
                .slots
                .lock()
                .ok()
                .and_then(|slots| slots.get(&space_id).and_then(|slot| slot.pending.deadline()));
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = wake.notified() => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let ready = self
                        .inner
                        .slots
                        .lock()
                        .ok()
                        .and_then(|mut slots| slots.get_mut(&space_id).and_then(|slot| slot.pending.take_ready()));
                    if let Some(snapshot) = ready {
                        // Errors are logged by save_with_retry; the next drag reschedules.
                        let _ = self.save_now(&space_id, &snapshot).await;
                    }
                }
            }
        }
        debug!(space_id = %space_id, "save worker stopped");
    }
}
