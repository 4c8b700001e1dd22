//! Cursor channel — ephemeral cursor positions over the ephemeral store.
//!
//! DESIGN
//! ======
//! Each session owns one record in the board's cursor namespace, keyed by
//! its session id. Positions are purely ephemeral: written, broadcast to
//! peers, and deleted when the session leaves. A disconnect hook registered
//! at mount deletes the record server-side if the transport dies first.
//!
//! Writes are capped per second. The first position in a window is written
//! immediately; later ones are coalesced and the newest is flushed when the
//! window closes, so the resting position is never lost.
//!
//! The channel shares nothing with the entity client: a cursor outage never
//! affects shape sync.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::helpers::{Throttle, now_ms};
use crate::remote::{DisconnectAction, EphemeralKey, EphemeralStore, NamespaceSnapshot, RemoteError};
use crate::session::Identity;

/// One peer's cursor as stored in the ephemeral store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub x: f64,
    pub y: f64,
    pub name: String,
    pub color: String,
    /// Write time, ms since epoch.
    pub timestamp: i64,
}

impl CursorRecord {
    #[must_use]
    pub fn is_stale(&self, now: i64, stale_after: Duration) -> bool {
        let age = now.saturating_sub(self.timestamp);
        u128::try_from(age).is_ok_and(|age| age > stale_after.as_millis())
    }
}

/// Namespace holding every cursor record of `board_id`.
#[must_use]
pub fn cursor_namespace(board_id: &str) -> String {
    format!("boards/{board_id}/cursors")
}

struct Gate {
    throttle: Throttle,
    pending: Option<(f64, f64)>,
    flush: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn EphemeralStore>,
    key: EphemeralKey,
    name: String,
    color: String,
    stale_after: Duration,
    cursors: watch::Sender<BTreeMap<String, CursorRecord>>,
    gate: Mutex<Gate>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    unmounted: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    async fn publish(&self, x: f64, y: f64) -> Result<(), RemoteError> {
        let record = CursorRecord {
            x,
            y,
            name: self.name.clone(),
            color: self.color.clone(),
            timestamp: now_ms(),
        };
        let value = serde_json::to_value(&record).map_err(|e| RemoteError::Other(e.to_string()))?;
        self.store.set(&self.key, value).await
    }

    fn abort_tasks(&self) {
        if let Some(handle) = locked(&self.subscription).take() {
            handle.abort();
        }
        let mut gate = locked(&self.gate);
        gate.pending = None;
        if let Some(handle) = gate.flush.take() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
        if self.unmounted.load(Ordering::Acquire) {
            return;
        }
        // Best effort: without a runtime the disconnect hook or staleness
        // filter cleans up instead.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(err) = store.remove(&key).await {
                debug!(%key, error = %err, "cursor: record not removed on drop");
            }
        });
    }
}

/// This session's view of and voice in a board's cursor namespace.
pub struct CursorChannel {
    inner: Arc<Inner>,
}

impl CursorChannel {
    /// Register the disconnect hook and start mirroring peer cursors.
    ///
    /// A failed hook registration is logged; the channel still works, but a
    /// crash would leave the record behind until it goes stale.
    pub async fn mount(store: Arc<dyn EphemeralStore>, board_id: &str, identity: &Identity, config: &SyncConfig) -> Self {
        let key = EphemeralKey::new(cursor_namespace(board_id), identity.session_id.to_string());
        if let Err(err) = store.on_disconnect(DisconnectAction::Remove(key.clone())).await {
            warn!(%key, error = %err, "cursor: disconnect hook not registered");
        }

        let (cursors, _) = watch::channel(BTreeMap::new());
        let inner = Arc::new(Inner {
            store,
            key,
            name: identity.name.clone(),
            color: identity.color.clone(),
            stale_after: config.cursor_stale_after,
            cursors,
            gate: Mutex::new(Gate {
                throttle: Throttle::per_second(config.cursor_updates_per_sec),
                pending: None,
                flush: None,
            }),
            subscription: Mutex::new(None),
            unmounted: AtomicBool::new(false),
        });

        let stream = inner.store.subscribe(&inner.key.namespace);
        let handle = tokio::spawn(mirror_peers(stream, Arc::downgrade(&inner)));
        *locked(&inner.subscription) = Some(handle);
        info!(key = %inner.key, "cursor: mounted");
        Self { inner }
    }

    /// Publish the local cursor position, subject to the write-rate cap.
    ///
    /// # Errors
    ///
    /// Returns the store error if an immediate write fails. Coalesced
    /// positions are written later and their failures are only logged.
    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<(), RemoteError> {
        {
            let mut gate = locked(&self.inner.gate);
            let now = Instant::now();
            if !gate.throttle.try_acquire_at(now) {
                gate.pending = Some((x, y));
                if gate.flush.as_ref().is_none_or(JoinHandle::is_finished) {
                    let delay = gate.throttle.remaining_at(now);
                    gate.flush = Some(tokio::spawn(flush_after(delay, Arc::downgrade(&self.inner))));
                }
                return Ok(());
            }
            gate.pending = None;
        }
        self.inner.publish(x, y).await
    }

    /// Delete this session's record.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn remove_cursor(&self) -> Result<(), RemoteError> {
        {
            let mut gate = locked(&self.inner.gate);
            gate.pending = None;
            if let Some(handle) = gate.flush.take() {
                handle.abort();
            }
        }
        self.inner.store.remove(&self.inner.key).await
    }

    /// Every peer cursor, including stale ones.
    #[must_use]
    pub fn cursors(&self) -> BTreeMap<String, CursorRecord> {
        self.inner.cursors.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BTreeMap<String, CursorRecord>> {
        self.inner.cursors.subscribe()
    }

    /// Peer cursors updated within the staleness window.
    #[must_use]
    pub fn active_cursors(&self) -> BTreeMap<String, CursorRecord> {
        self.active_cursors_at(now_ms())
    }

    #[must_use]
    pub fn active_cursors_at(&self, now: i64) -> BTreeMap<String, CursorRecord> {
        self.inner
            .cursors
            .borrow()
            .iter()
            .filter(|(_, record)| !record.is_stale(now, self.inner.stale_after))
            .map(|(k, record)| (k.clone(), record.clone()))
            .collect()
    }

    /// Stop background work and delete this session's record.
    pub async fn shutdown(&self) {
        self.inner.unmounted.store(true, Ordering::Release);
        self.inner.abort_tasks();
        if let Err(err) = self.inner.store.remove(&self.inner.key).await {
            warn!(key = %self.inner.key, error = %err, "cursor: record not removed on shutdown");
        }
        info!(key = %self.inner.key, "cursor: unmounted");
    }
}

async fn flush_after(delay: Duration, weak: Weak<Inner>) {
    tokio::time::sleep(delay).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let position = {
        let mut gate = locked(&inner.gate);
        gate.flush = None;
        let position = gate.pending.take();
        if position.is_some() {
            gate.throttle.try_acquire();
        }
        position
    };
    if let Some((x, y)) = position {
        if let Err(err) = inner.publish(x, y).await {
            warn!(key = %inner.key, error = %err, "cursor: trailing write failed");
        }
    }
}

async fn mirror_peers(mut stream: crate::remote::NamespaceStream, weak: Weak<Inner>) {
    while let Some(event) = stream.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            Ok(snapshot) => {
                let peers = peer_records(snapshot, &inner.key.key);
                inner.cursors.send_replace(peers);
            }
            Err(err) => {
                warn!(key = %inner.key, error = %err, "cursor: subscription ended");
                break;
            }
        }
    }
    debug!("cursor: subscription task ended");
}

fn peer_records(snapshot: NamespaceSnapshot, own_key: &str) -> BTreeMap<String, CursorRecord> {
    snapshot
        .into_iter()
        .filter(|(key, _)| key != own_key)
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(record) => Some((key, record)),
            Err(err) => {
                debug!(%key, error = %err, "cursor: skipping malformed record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "cursor_test.rs"]
mod tests;
