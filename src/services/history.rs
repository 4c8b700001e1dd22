//! Undo/redo history of session-originated shape mutations.
//!
//! DESIGN
//! ======
//! Two bounded stacks of owned before/after snapshots. Recording a fresh
//! mutation clears the redo stack; the oldest entry is evicted once a stack
//! reaches capacity.
//!
//! Replaying an entry goes through the ordinary entity client operations, and
//! those produce the same mutations the session would normally record. The
//! session therefore holds a `ReplayGuard` across the whole replay; while any
//! guard is alive every `record_*` call is ignored.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::helpers::now_ms;
use crate::services::entity::{EntityStoreClient, SyncError};
use crate::shape::{Shape, ShapeId, ShapePatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Create,
    Update,
    Delete,
}

/// One recorded mutation. `before` is `None` for creates, `after` is `None`
/// for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub entity_id: ShapeId,
    pub before: Option<Shape>,
    pub after: Option<Shape>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Undo,
    Redo,
}

/// Suppresses recording on the log that issued it until dropped.
#[must_use = "recording resumes as soon as the guard is dropped"]
pub struct ReplayGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct HistoryLog {
    undo: VecDeque<HistoryEntry>,
    redo: VecDeque<HistoryEntry>,
    capacity: usize,
    replay_depth: Arc<AtomicUsize>,
}

impl HistoryLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            capacity: capacity.max(1),
            replay_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    // =========================================================================
    // RECORDING
    // =========================================================================

    pub fn record_create(&mut self, shape: &Shape) {
        self.record(HistoryKind::Create, shape.id, None, Some(shape.clone()));
    }

    /// Record an update. Identical before/after content records nothing.
    pub fn record_update(&mut self, before: &Shape, after: &Shape) {
        if before.same_content(after) {
            debug!(id = %after.id, "history: no-op update not recorded");
            return;
        }
        self.record(HistoryKind::Update, after.id, Some(before.clone()), Some(after.clone()));
    }

    pub fn record_delete(&mut self, shape: &Shape) {
        self.record(HistoryKind::Delete, shape.id, Some(shape.clone()), None);
    }

    fn record(&mut self, kind: HistoryKind, entity_id: ShapeId, before: Option<Shape>, after: Option<Shape>) {
        if self.is_replaying() {
            debug!(%entity_id, ?kind, "history: recording suppressed during replay");
            return;
        }
        let entry = HistoryEntry { kind, entity_id, before, after, timestamp: now_ms() };
        push_bounded(&mut self.undo, entry, self.capacity);
        self.redo.clear();
    }

    // =========================================================================
    // NAVIGATION
    // =========================================================================

    /// Move the newest undo entry onto the redo stack and return it for replay.
    pub fn undo(&mut self) -> Option<HistoryEntry> {
        let entry = self.undo.pop_back()?;
        push_bounded(&mut self.redo, entry.clone(), self.capacity);
        Some(entry)
    }

    /// Move the newest redo entry onto the undo stack and return it for replay.
    pub fn redo(&mut self) -> Option<HistoryEntry> {
        let entry = self.redo.pop_back()?;
        push_bounded(&mut self.undo, entry.clone(), self.capacity);
        Some(entry)
    }

    /// Put back an entry whose undo replay failed.
    pub fn revert_undo(&mut self, entry: HistoryEntry) {
        take_entry(&mut self.redo, &entry);
        push_bounded(&mut self.undo, entry, self.capacity);
    }

    /// Put back an entry whose redo replay failed.
    pub fn revert_redo(&mut self, entry: HistoryEntry) {
        take_entry(&mut self.undo, &entry);
        push_bounded(&mut self.redo, entry, self.capacity);
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest entry on the undo stack.
    #[cfg(test)]
    pub(crate) fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo.back()
    }

    // =========================================================================
    // REPLAY BRACKET
    // =========================================================================

    /// Start a replay bracket. Brackets nest.
    pub fn begin_replay(&self) -> ReplayGuard {
        self.replay_depth.fetch_add(1, Ordering::AcqRel);
        ReplayGuard { depth: Arc::clone(&self.replay_depth) }
    }

    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replay_depth.load(Ordering::Acquire) > 0
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_CAPACITY)
    }
}

fn push_bounded(stack: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, capacity: usize) {
    stack.push_back(entry);
    while stack.len() > capacity {
        stack.pop_front();
    }
}

fn take_entry(stack: &mut VecDeque<HistoryEntry>, entry: &HistoryEntry) {
    if let Some(pos) = stack.iter().rposition(|e| e == entry) {
        stack.remove(pos);
    }
}

// =============================================================================
// REPLAY
// =============================================================================

/// Apply the inverse (`Undo`) or the original (`Redo`) of `entry` through the
/// entity client.
///
/// # Errors
///
/// Whatever the underlying entity client operation returns.
pub async fn replay(store: &EntityStoreClient, entry: &HistoryEntry, direction: ReplayDirection) -> Result<(), SyncError> {
    let id = entry.entity_id;
    debug!(%id, kind = ?entry.kind, ?direction, "history: replaying");
    match (entry.kind, direction) {
        (HistoryKind::Create, ReplayDirection::Undo) | (HistoryKind::Delete, ReplayDirection::Redo) => {
            store.delete(id).await
        }
        (HistoryKind::Delete, ReplayDirection::Undo) => restore_snapshot(store, id, entry.before.as_ref()).await,
        (HistoryKind::Create, ReplayDirection::Redo) => restore_snapshot(store, id, entry.after.as_ref()).await,
        (HistoryKind::Update, ReplayDirection::Undo) => apply_snapshot(store, id, entry.before.as_ref()).await,
        (HistoryKind::Update, ReplayDirection::Redo) => apply_snapshot(store, id, entry.after.as_ref()).await,
    }
}

async fn restore_snapshot(store: &EntityStoreClient, id: ShapeId, snapshot: Option<&Shape>) -> Result<(), SyncError> {
    let Some(shape) = snapshot else {
        warn!(%id, "history: entry has no snapshot to restore");
        return Ok(());
    };
    store.restore(shape.clone()).await.map(|_| ())
}

async fn apply_snapshot(store: &EntityStoreClient, id: ShapeId, snapshot: Option<&Shape>) -> Result<(), SyncError> {
    let Some(shape) = snapshot else {
        warn!(%id, "history: entry has no snapshot to apply");
        return Ok(());
    };
    store.update(id, ShapePatch::from_shape(shape)).await
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
