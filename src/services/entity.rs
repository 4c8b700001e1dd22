//! Entity store client — optimistic local mirror of the shared shapes.
//!
//! DESIGN
//! ======
//! Every mutation is applied to local state first, then written to the
//! remote store as an individual per-entity record. There is no queue or
//! batching: each call is independent, which is safe because no two
//! entities share a remote document.
//!
//! The push subscription is the authority. Every notification replaces the
//! whole local snapshot (no merge), which is what eventually corrects any
//! optimistic skew. A fresh snapshot can overwrite a local change whose write
//! has not been acknowledged yet; that write still completes normally.
//!
//! ERROR HANDLING
//! ==============
//! - `NotFound` is benign: the entity was deleted elsewhere and the next
//!   snapshot will say so.
//! - `PermissionDenied` is surfaced, and an optimistic insert or removal
//!   that can still be reversed is rolled back.
//! - Anything else is surfaced, but optimistic state is kept to avoid
//!   flicker until the next snapshot corrects it. Creates are the exception:
//!   a failed create is always rolled back.
//! - A subscription error is terminal for this client's sync.
//!
//! SOFT LOCKS
//! ==========
//! `lock` marks an entity as being manipulated and arms an auto-release
//! timer. Timers are owned per id; re-locking replaces the timer, and each
//! timer carries a generation so a replaced timer can never release a newer
//! lock. Whether a lock is honored is the caller's concern (`editable_by`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::helpers::{next_stamp, now_ms};
use crate::remote::{RemoteEntityStore, RemoteError};
use crate::shape::{Selector, Shape, ShapeDraft, ShapeError, ShapeId, ShapePatch, UserId};

// =============================================================================
// TYPES
// =============================================================================

/// Failures surfaced to callers of the entity store client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("remote write failed: {0}")]
    Remote(String),
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("invalid shape: {0}")]
    InvalidShape(#[from] ShapeError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            other => Self::Remote(other.to_string()),
        }
    }
}

impl crate::error::ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "E_PERMISSION_DENIED",
            Self::Remote(_) => "E_REMOTE_WRITE",
            Self::Subscription(_) => "E_SUBSCRIPTION",
            Self::InvalidShape(_) => "E_INVALID_SHAPE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Reactive state published to renderers.
#[derive(Debug, Clone)]
pub struct StoreView {
    pub shapes: HashMap<ShapeId, Shape>,
    /// True until the first snapshot (or a subscription failure) arrives.
    pub loading: bool,
    pub error: Option<SyncError>,
}

impl StoreView {
    /// Shapes in render order: z-index, then creation time, then id.
    #[must_use]
    pub fn ordered(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.shapes.values().cloned().collect();
        shapes.sort_by(|a, b| {
            a.z_index
                .unwrap_or(0)
                .cmp(&b.z_index.unwrap_or(0))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        shapes
    }
}

struct LockTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Optimistic client over a `RemoteEntityStore`. Cheap to clone.
#[derive(Clone)]
pub struct EntityStoreClient {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn RemoteEntityStore>,
    user_id: UserId,
    lock_timeout: Duration,
    view: watch::Sender<StoreView>,
    locks: Mutex<HashMap<ShapeId, LockTimer>>,
    lock_generation: AtomicU64,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Record `err` as the current error state and hand it back.
    fn surface(&self, err: SyncError) -> SyncError {
        self.view.send_modify(|v| v.error = Some(err.clone()));
        err
    }

    fn replace_snapshot(&self, shapes: Vec<Shape>) {
        let count = shapes.len();
        self.view.send_modify(|v| {
            v.shapes = shapes.into_iter().map(|s| (s.id, s)).collect();
            v.loading = false;
        });
        debug!(count, "sync: snapshot applied");
    }

    fn fail_subscription(&self, err: &RemoteError) {
        error!(error = %err, "sync: subscription failed");
        self.view.send_modify(|v| {
            v.loading = false;
            v.error = Some(SyncError::Subscription(err.to_string()));
        });
    }

    fn abort_tasks(&self) {
        if let Some(handle) = locked(&self.subscription).take() {
            handle.abort();
        }
        for (_, timer) in locked(&self.locks).drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl EntityStoreClient {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteEntityStore>, user_id: impl Into<UserId>, config: &SyncConfig) -> Self {
        let (view, _) = watch::channel(StoreView { shapes: HashMap::new(), loading: true, error: None });
        Self {
            inner: Arc::new(Inner {
                remote,
                user_id: user_id.into(),
                lock_timeout: config.lock_timeout,
                view,
                locks: Mutex::new(HashMap::new()),
                lock_generation: AtomicU64::new(0),
                subscription: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    // =========================================================================
    // SUBSCRIPTION
    // =========================================================================

    /// Open the push subscription to the whole collection. Idempotent while
    /// the subscription task is alive.
    pub fn activate(&self) {
        let mut slot = locked(&self.inner.subscription);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let mut stream = self.inner.remote.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(shapes) => inner.replace_snapshot(shapes),
                    Err(err) => {
                        inner.fail_subscription(&err);
                        break;
                    }
                }
            }
            debug!("sync: subscription task ended");
        }));
        info!(user_id = %self.inner.user_id, "sync: subscription opened");
    }

    /// Stop the subscription and abort every pending lock timer.
    pub fn shutdown(&self) {
        self.inner.abort_tasks();
        info!(user_id = %self.inner.user_id, "sync: client shut down");
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Subscribe to `{shapes, loading, error}` changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StoreView> {
        self.inner.view.subscribe()
    }

    #[must_use]
    pub fn view(&self) -> StoreView {
        self.inner.view.borrow().clone()
    }

    #[must_use]
    pub fn get(&self, id: ShapeId) -> Option<Shape> {
        self.inner.view.borrow().shapes.get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: ShapeId) -> bool {
        self.inner.view.borrow().shapes.contains_key(&id)
    }

    /// All shapes in render order.
    #[must_use]
    pub fn shapes(&self) -> Vec<Shape> {
        self.inner.view.borrow().ordered()
    }

    #[must_use]
    pub fn find(&self, selector: &Selector) -> Vec<Shape> {
        self.shapes()
            .into_iter()
            .filter(|s| selector.matches(s))
            .collect()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.view.borrow().loading
    }

    #[must_use]
    pub fn error(&self) -> Option<SyncError> {
        self.inner.view.borrow().error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.view.send_if_modified(|v| v.error.take().is_some());
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create a shape owned by this client's user.
    ///
    /// # Errors
    ///
    /// `InvalidShape` if the draft fails validation (nothing is written);
    /// otherwise the classified remote error, after the optimistic insert
    /// has been rolled back.
    pub async fn create(&self, draft: ShapeDraft) -> Result<Shape, SyncError> {
        let shape = Shape::from_draft(draft, self.inner.user_id.clone(), now_ms())?;
        self.insert_optimistic(shape).await
    }

    /// Re-insert a previously existing shape under its original id.
    ///
    /// The update stamp is bumped and any lock is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create`].
    pub async fn restore(&self, mut shape: Shape) -> Result<Shape, SyncError> {
        shape.updated_at = next_stamp(shape.updated_at);
        shape.locked_by = None;
        shape.validate()?;
        self.insert_optimistic(shape).await
    }

    async fn insert_optimistic(&self, shape: Shape) -> Result<Shape, SyncError> {
        let id = shape.id;
        self.inner.view.send_modify(|v| {
            v.shapes.insert(id, shape.clone());
        });
        debug!(%id, kind = %shape.kind(), "sync: optimistic insert");

        match self.inner.remote.put(&shape).await {
            Ok(()) => Ok(shape),
            Err(err) => {
                self.inner.view.send_if_modified(|v| v.shapes.remove(&id).is_some());
                error!(%id, error = %err, "sync: create failed, rolled back");
                Err(self.inner.surface(err.into()))
            }
        }
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Merge `patch` into a shape and write the same fields remotely.
    ///
    /// A shape missing locally is a no-op. A shape missing remotely is
    /// benign. Other remote failures are surfaced without rolling back.
    ///
    /// # Errors
    ///
    /// `InvalidShape` if the patched shape would be invalid (nothing is
    /// written); otherwise the classified remote error.
    pub async fn update(&self, id: ShapeId, patch: ShapePatch) -> Result<(), SyncError> {
        let Some(patch) = self.apply_local(id, patch)? else {
            warn!(%id, "sync: update ignored, shape not present locally");
            return Ok(());
        };

        match self.inner.remote.patch(id, &patch).await {
            Ok(()) => Ok(()),
            Err(RemoteError::NotFound(_)) => {
                warn!(%id, "sync: update target deleted remotely");
                Ok(())
            }
            Err(err) => {
                error!(%id, error = %err, "sync: update failed");
                Err(self.inner.surface(err.into()))
            }
        }
    }

    /// Stamp and apply `patch` to the local copy. Returns the stamped patch,
    /// or `None` if the shape is not present locally.
    fn apply_local(&self, id: ShapeId, patch: ShapePatch) -> Result<Option<ShapePatch>, ShapeError> {
        let mut outcome = Ok(None);
        self.inner.view.send_if_modified(|v| {
            let Some(shape) = v.shapes.get_mut(&id) else {
                return false;
            };
            let stamped = patch.stamped(next_stamp(shape.updated_at));
            match stamped.apply(shape) {
                Ok(()) => {
                    outcome = Ok(Some(stamped));
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Remove a shape locally, then remotely. Deleting a missing shape succeeds.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` (the removal is rolled back) or `Remote` (the
    /// removal is kept).
    pub async fn delete(&self, id: ShapeId) -> Result<(), SyncError> {
        self.cancel_lock_timer(id);
        let mut removed = None;
        self.inner.view.send_if_modified(|v| {
            removed = v.shapes.remove(&id);
            removed.is_some()
        });
        debug!(%id, present = removed.is_some(), "sync: optimistic delete");

        match self.inner.remote.remove(id).await {
            Ok(()) => Ok(()),
            Err(RemoteError::NotFound(_)) => {
                debug!(%id, "sync: delete target already gone");
                Ok(())
            }
            Err(err @ RemoteError::PermissionDenied(_)) => {
                if let Some(shape) = removed {
                    self.inner.view.send_modify(|v| {
                        v.shapes.entry(id).or_insert(shape);
                    });
                }
                error!(%id, error = %err, "sync: delete denied, restored");
                Err(self.inner.surface(err.into()))
            }
            Err(err) => {
                error!(%id, error = %err, "sync: delete failed, keeping local removal");
                Err(self.inner.surface(err.into()))
            }
        }
    }

    // =========================================================================
    // SOFT LOCKS
    // =========================================================================

    /// Mark `id` as held by `holder` and (re)arm its auto-release timer.
    ///
    /// A vanished entity abandons the attempt silently. Lock failures never
    /// set the error state.
    ///
    /// # Errors
    ///
    /// Returns the classified remote error for failures other than `NotFound`.
    pub async fn lock(&self, id: ShapeId, holder: impl Into<UserId>) -> Result<(), SyncError> {
        let holder = holder.into();
        if !self.contains(id) {
            self.cancel_lock_timer(id);
            debug!(%id, "lock: shape gone, abandoned");
            return Ok(());
        }

        let Some(patch) = self.apply_local(id, ShapePatch::lock(holder.clone()))? else {
            self.cancel_lock_timer(id);
            return Ok(());
        };
        self.arm_lock_timer(id);
        debug!(%id, %holder, "lock: acquired");

        match self.inner.remote.patch(id, &patch).await {
            Ok(()) => Ok(()),
            Err(RemoteError::NotFound(_)) => {
                self.cancel_lock_timer(id);
                debug!(%id, "lock: shape deleted remotely, abandoned");
                Ok(())
            }
            Err(err) => {
                warn!(%id, error = %err, "lock: remote write failed");
                Err(err.into())
            }
        }
    }

    /// Clear the auto-release timer and release the lock.
    ///
    /// # Errors
    ///
    /// Returns the classified remote error for failures other than `NotFound`.
    pub async fn unlock(&self, id: ShapeId) -> Result<(), SyncError> {
        self.cancel_lock_timer(id);
        self.release(id).await
    }

    async fn release(&self, id: ShapeId) -> Result<(), SyncError> {
        let Some(patch) = self.apply_local(id, ShapePatch::unlock())? else {
            debug!(%id, "lock: nothing to release");
            return Ok(());
        };

        match self.inner.remote.patch(id, &patch).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(err) => {
                warn!(%id, error = %err, "lock: release write failed");
                Err(err.into())
            }
        }
    }

    /// Number of armed auto-release timers.
    #[must_use]
    pub fn pending_lock_timers(&self) -> usize {
        locked(&self.inner.locks).len()
    }

    #[cfg(test)]
    pub(crate) fn has_lock_timer(&self, id: ShapeId) -> bool {
        locked(&self.inner.locks).contains_key(&id)
    }

    fn arm_lock_timer(&self, id: ShapeId) {
        let generation = self.inner.lock_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = self.inner.lock_timeout;
        let weak = Arc::downgrade(&self.inner);

        // Hold the map while spawning so the timer cannot look itself up
        // before it is registered.
        let mut locks = locked(&self.inner.locks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let client = EntityStoreClient { inner };
            if !client.take_expired_timer(id, generation) {
                return;
            }
            info!(%id, "lock: auto-release after timeout");
            if let Err(err) = client.release(id).await {
                warn!(%id, error = %err, "lock: auto-release failed");
            }
        });
        if let Some(previous) = locks.insert(id, LockTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Deregister the timer for `id` if it is still generation `generation`.
    /// Detaches rather than aborts, since the caller is that timer.
    fn take_expired_timer(&self, id: ShapeId, generation: u64) -> bool {
        let mut locks = locked(&self.inner.locks);
        if locks.get(&id).is_some_and(|t| t.generation == generation) {
            locks.remove(&id);
            true
        } else {
            false
        }
    }

    fn cancel_lock_timer(&self, id: ShapeId) {
        if let Some(timer) = locked(&self.inner.locks).remove(&id) {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "entity_test.rs"]
mod tests;
