//! Shared helpers: wall-clock stamps, user colors, and a rate gate.
//!
//! DESIGN
//! ======
//! Everything here is a plain value or pure function. Color assignment is a
//! deterministic hash over the user id, so two sessions agree on a peer's
//! color without any shared registry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Palette used for cursor and presence colors.
pub const USER_COLORS: &[&str] = &[
    "#e74c3c", "#3498db", "#2ecc71", "#9b59b6", "#f39c12", "#1abc9c", "#e67e22", "#34495e",
];

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Next `updated_at` for a local mutation: the wall clock, but never at or
/// before `previous`.
#[must_use]
pub fn next_stamp(previous: i64) -> i64 {
    now_ms().max(previous.saturating_add(1))
}

/// Stable palette color for a user id (FNV-1a over the id bytes).
#[must_use]
pub fn color_for(user_id: &str) -> &'static str {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    USER_COLORS[hash as usize % USER_COLORS.len()]
}

// =============================================================================
// THROTTLE
// =============================================================================

/// Leading-edge rate gate: at most one acquisition per `interval`.
///
/// Uses tokio's clock so paused-time tests can drive it.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Gate allowing `rate` acquisitions per second. A zero rate is treated as one.
    #[must_use]
    pub fn per_second(rate: u32) -> Self {
        Self::new(Duration::from_secs(1) / rate.max(1))
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Acquire the gate if the interval has elapsed since the last acquisition.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if self.remaining_at(now).is_zero() {
            self.last = Some(now);
            true
        } else {
            false
        }
    }

    /// Time until the gate opens again.
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.interval.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Forget the last acquisition so the next call passes.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
#[path = "helpers_test.rs"]
mod tests;
