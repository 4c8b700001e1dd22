//! Sync tuning knobs parsed from environment variables.
//!
//! Every value has a default matching the documented behavior; unset or
//! unparseable variables fall back to it.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CURSOR_UPDATES_PER_SEC: u32 = 60;
pub const DEFAULT_CURSOR_STALE_SECS: u64 = 300;
pub const DEFAULT_PRESENCE_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_PRESENCE_ACTIVITY_THROTTLE_SECS: u64 = 5;
pub const DEFAULT_PRESENCE_ACTIVE_WINDOW_SECS: u64 = 120;
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_DIAGNOSTIC_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Hard expiry of a soft lock after the last `lock` call.
    pub lock_timeout: Duration,
    /// Ceiling on cursor writes per second.
    pub cursor_updates_per_sec: u32,
    /// Cursors older than this are hidden from the active view.
    pub cursor_stale_after: Duration,
    /// Presence refresh period while mounted.
    pub presence_heartbeat: Duration,
    /// Minimum spacing between activity-triggered presence writes.
    pub presence_activity_throttle: Duration,
    /// `last_seen` recency that counts as active rather than away.
    pub presence_active_window: Duration,
    /// Entries kept per undo/redo stack.
    pub history_capacity: usize,
    /// Entries kept in the diagnostic log.
    pub diagnostic_capacity: usize,
    /// Where the diagnostic log is persisted. `None` keeps it in memory.
    pub diagnostic_path: Option<PathBuf>,
}

impl SyncConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `LOCK_TIMEOUT_MS`: default 5000
    /// - `CURSOR_UPDATES_PER_SEC`: default 60
    /// - `CURSOR_STALE_SECS`: default 300
    /// - `PRESENCE_HEARTBEAT_SECS`: default 30
    /// - `PRESENCE_ACTIVITY_THROTTLE_SECS`: default 5
    /// - `PRESENCE_ACTIVE_WINDOW_SECS`: default 120
    /// - `HISTORY_CAPACITY`: default 50
    /// - `DIAGNOSTIC_LOG_CAPACITY`: default 50
    /// - `DIAGNOSTIC_LOG_PATH`: unset keeps the log in memory
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            lock_timeout: Duration::from_millis(env_parse("LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS)),
            cursor_updates_per_sec: env_parse("CURSOR_UPDATES_PER_SEC", DEFAULT_CURSOR_UPDATES_PER_SEC).max(1),
            cursor_stale_after: Duration::from_secs(env_parse("CURSOR_STALE_SECS", DEFAULT_CURSOR_STALE_SECS)),
            presence_heartbeat: Duration::from_secs(
                env_parse("PRESENCE_HEARTBEAT_SECS", DEFAULT_PRESENCE_HEARTBEAT_SECS).max(1),
            ),
            presence_activity_throttle: Duration::from_secs(env_parse(
                "PRESENCE_ACTIVITY_THROTTLE_SECS",
                DEFAULT_PRESENCE_ACTIVITY_THROTTLE_SECS,
            )),
            presence_active_window: Duration::from_secs(env_parse(
                "PRESENCE_ACTIVE_WINDOW_SECS",
                DEFAULT_PRESENCE_ACTIVE_WINDOW_SECS,
            )),
            history_capacity: env_parse("HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY).max(1),
            diagnostic_capacity: env_parse("DIAGNOSTIC_LOG_CAPACITY", DEFAULT_DIAGNOSTIC_LOG_CAPACITY).max(1),
            diagnostic_path: std::env::var("DIAGNOSTIC_LOG_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            cursor_updates_per_sec: DEFAULT_CURSOR_UPDATES_PER_SEC,
            cursor_stale_after: Duration::from_secs(DEFAULT_CURSOR_STALE_SECS),
            presence_heartbeat: Duration::from_secs(DEFAULT_PRESENCE_HEARTBEAT_SECS),
            presence_activity_throttle: Duration::from_secs(DEFAULT_PRESENCE_ACTIVITY_THROTTLE_SECS),
            presence_active_window: Duration::from_secs(DEFAULT_PRESENCE_ACTIVE_WINDOW_SECS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_LOG_CAPACITY,
            diagnostic_path: None,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
