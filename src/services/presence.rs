//! Presence channel — who is on the board and how recently they acted.
//!
//! DESIGN
//! ======
//! Each session owns one record in the board's presence namespace. Mounting
//! writes `online`, registers a disconnect hook that writes `offline` with a
//! server-stamped `last_seen`, and starts a heartbeat that keeps `last_seen`
//! fresh. Activity refreshes are rate limited. Display status is derived by
//! readers from `status` and the age of `last_seen`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::helpers::{Throttle, now_ms};
use crate::remote::{DisconnectAction, EphemeralKey, EphemeralStore, NamespaceStream, RemoteError};
use crate::session::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Status as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDisplay {
    Active,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub name: String,
    pub color: String,
    /// ms since epoch.
    pub last_seen: i64,
}

impl PresenceRecord {
    /// `Offline` if stored offline, `Active` if seen within `window`, else `Away`.
    #[must_use]
    pub fn display_status(&self, now: i64, window: Duration) -> PresenceDisplay {
        if self.status == PresenceStatus::Offline {
            return PresenceDisplay::Offline;
        }
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if now.saturating_sub(self.last_seen) <= window_ms {
            PresenceDisplay::Active
        } else {
            PresenceDisplay::Away
        }
    }
}

/// One row of the derived roster.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub session_id: String,
    pub name: String,
    pub color: String,
    pub status: PresenceDisplay,
    pub last_seen: i64,
}

#[must_use]
pub fn presence_namespace(board_id: &str) -> String {
    format!("boards/{board_id}/presence")
}

struct Inner {
    store: Arc<dyn EphemeralStore>,
    key: EphemeralKey,
    name: String,
    color: String,
    active_window: Duration,
    records: watch::Sender<BTreeMap<String, PresenceRecord>>,
    activity: Mutex<Throttle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn record(&self, status: PresenceStatus) -> PresenceRecord {
        PresenceRecord {
            status,
            name: self.name.clone(),
            color: self.color.clone(),
            last_seen: now_ms(),
        }
    }

    async fn write(&self, status: PresenceStatus) -> Result<(), RemoteError> {
        let value = serde_json::to_value(self.record(status)).map_err(|e| RemoteError::Other(e.to_string()))?;
        self.store.set(&self.key, value).await
    }

    fn abort_tasks(&self) {
        for handle in locked(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

pub struct PresenceChannel {
    inner: Arc<Inner>,
}

impl PresenceChannel {
    /// Announce this session, arm the offline hook, and start the heartbeat
    /// and roster subscription. Store failures are logged, not returned.
    pub async fn mount(store: Arc<dyn EphemeralStore>, board_id: &str, identity: &Identity, config: &SyncConfig) -> Self {
        let (records, _) = watch::channel(BTreeMap::new());
        let inner = Arc::new(Inner {
            store,
            key: EphemeralKey::new(presence_namespace(board_id), identity.session_id.to_string()),
            name: identity.name.clone(),
            color: identity.color.clone(),
            active_window: config.presence_active_window,
            records,
            activity: Mutex::new(Throttle::new(config.presence_activity_throttle)),
            tasks: Mutex::new(Vec::new()),
        });

        if let Err(err) = inner.write(PresenceStatus::Online).await {
            warn!(key = %inner.key, error = %err, "presence: online write failed");
        }
        locked(&inner.activity).try_acquire();

        match serde_json::to_value(inner.record(PresenceStatus::Offline)) {
            Ok(value) => {
                let hook = DisconnectAction::Write { key: inner.key.clone(), value, stamp_field: Some("last_seen") };
                if let Err(err) = inner.store.on_disconnect(hook).await {
                    warn!(key = %inner.key, error = %err, "presence: disconnect hook not registered");
                }
            }
            Err(err) => warn!(key = %inner.key, error = %err, "presence: offline record not encodable"),
        }

        let stream = inner.store.subscribe(&inner.key.namespace);
        let subscription = tokio::spawn(mirror_roster(stream, Arc::downgrade(&inner)));
        let heartbeat = tokio::spawn(heartbeat(config.presence_heartbeat, Arc::downgrade(&inner)));
        locked(&inner.tasks).extend([subscription, heartbeat]);

        info!(key = %inner.key, "presence: mounted");
        Self { inner }
    }

    /// Refresh `last_seen` after local activity, at most once per throttle
    /// window. Returns whether a write was issued.
    ///
    /// # Errors
    ///
    /// Returns the store error of an issued write.
    pub async fn update_activity(&self) -> Result<bool, RemoteError> {
        if !locked(&self.inner.activity).try_acquire() {
            return Ok(false);
        }
        self.inner.write(PresenceStatus::Online).await?;
        Ok(true)
    }

    /// Every presence record in the namespace, including this session's.
    #[must_use]
    pub fn presence(&self) -> BTreeMap<String, PresenceRecord> {
        self.inner.records.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BTreeMap<String, PresenceRecord>> {
        self.inner.records.subscribe()
    }

    #[must_use]
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster_at(now_ms())
    }

    #[must_use]
    pub fn roster_at(&self, now: i64) -> Vec<RosterEntry> {
        self.inner
            .records
            .borrow()
            .iter()
            .map(|(session_id, record)| RosterEntry {
                session_id: session_id.clone(),
                name: record.name.clone(),
                color: record.color.clone(),
                status: record.display_status(now, self.inner.active_window),
                last_seen: record.last_seen,
            })
            .collect()
    }

    /// Stop the heartbeat and subscription and write `offline`.
    pub async fn shutdown(&self) {
        self.inner.abort_tasks();
        if let Err(err) = self.inner.write(PresenceStatus::Offline).await {
            warn!(key = %self.inner.key, error = %err, "presence: offline write failed");
        }
        info!(key = %self.inner.key, "presence: unmounted");
    }
}

async fn heartbeat(period: Duration, weak: Weak<Inner>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; mount already wrote.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if let Err(err) = inner.write(PresenceStatus::Online).await {
            warn!(key = %inner.key, error = %err, "presence: heartbeat write failed");
        }
    }
}

async fn mirror_roster(mut stream: NamespaceStream, weak: Weak<Inner>) {
    while let Some(event) = stream.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            Ok(snapshot) => {
                let records = snapshot
                    .into_iter()
                    .filter_map(|(key, value)| match serde_json::from_value::<PresenceRecord>(value) {
                        Ok(record) => Some((key, record)),
                        Err(err) => {
                            debug!(%key, error = %err, "presence: skipping malformed record");
                            None
                        }
                    })
                    .collect();
                inner.records.send_replace(records);
            }
            Err(err) => {
                warn!(key = %inner.key, error = %err, "presence: subscription ended");
                break;
            }
        }
    }
    debug!("presence: subscription task ended");
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
