use std::sync::Arc;

use super::*;
use crate::config::SyncConfig;
use crate::remote::RemoteError;
use crate::remote::memory::{EntityOp, MemoryEntityStore};
use crate::shape::ShapeDraft;

fn shape(x: f64) -> Shape {
    Shape::from_draft(ShapeDraft::rectangle(x, 0.0, 10.0, 10.0, "#3498db"), "alice", 1).unwrap()
}

fn moved(shape: &Shape, x: f64) -> Shape {
    let mut next = shape.clone();
    ShapePatch::position(x, 0.0).stamped(shape.updated_at + 1).apply(&mut next).unwrap();
    next
}

// =============================================================================
// recording
// =============================================================================

#[test]
fn record_pushes_and_clears_redo() {
    let mut log = HistoryLog::new(50);
    let a = shape(0.0);
    log.record_create(&a);
    assert!(log.can_undo());
    assert!(!log.can_redo());

    log.undo().unwrap();
    assert!(log.can_redo());

    log.record_delete(&a);
    assert!(!log.can_redo());
    assert_eq!(log.undo_depth(), 1);
    assert_eq!(log.peek_undo().unwrap().kind, HistoryKind::Delete);
}

#[test]
fn entries_carry_snapshots_per_kind() {
    let mut log = HistoryLog::new(50);
    let a = shape(0.0);
    let b = moved(&a, 5.0);

    log.record_create(&a);
    let create = log.peek_undo().unwrap().clone();
    assert_eq!((create.before, create.after), (None, Some(a.clone())));

    log.record_update(&a, &b);
    let update = log.peek_undo().unwrap().clone();
    assert_eq!((update.before, update.after), (Some(a.clone()), Some(b.clone())));

    log.record_delete(&b);
    let delete = log.peek_undo().unwrap().clone();
    assert_eq!((delete.before, delete.after), (Some(b), None));
    assert_eq!(delete.entity_id, a.id);
}

#[test]
fn no_op_update_is_not_recorded() {
    let mut log = HistoryLog::new(50);
    let a = shape(0.0);
    let mut relocked = a.clone();
    relocked.locked_by = Some("alice".into());
    relocked.updated_at += 10;

    log.record_update(&a, &a);
    log.record_update(&a, &relocked);
    assert!(!log.can_undo());
}

#[test]
fn capacity_evicts_oldest_first() {
    let mut log = HistoryLog::new(50);
    let shapes: Vec<Shape> = (0..51).map(|i| shape(f64::from(i))).collect();
    for s in &shapes {
        log.record_create(s);
    }
    assert_eq!(log.undo_depth(), 50);

    let mut undone = Vec::new();
    while let Some(entry) = log.undo() {
        undone.push(entry.entity_id);
    }
    assert_eq!(undone.len(), 50);
    assert!(!undone.contains(&shapes[0].id));
    assert_eq!(undone.first(), Some(&shapes[50].id));
    assert_eq!(undone.last(), Some(&shapes[1].id));
}

#[test]
fn zero_capacity_is_clamped() {
    let mut log = HistoryLog::new(0);
    assert_eq!(log.capacity(), 1);
    log.record_create(&shape(0.0));
    log.record_create(&shape(1.0));
    assert_eq!(log.undo_depth(), 1);
}

#[test]
fn clear_empties_both_stacks() {
    let mut log = HistoryLog::default();
    log.record_create(&shape(0.0));
    log.record_create(&shape(1.0));
    log.undo();
    log.clear();
    assert!(!log.can_undo());
    assert!(!log.can_redo());
}

// =============================================================================
// replay bracket
// =============================================================================

#[test]
fn recording_is_suppressed_inside_bracket() {
    let mut log = HistoryLog::new(50);
    let guard = log.begin_replay();
    assert!(log.is_replaying());
    log.record_create(&shape(0.0));
    assert!(!log.can_undo());
    drop(guard);

    assert!(!log.is_replaying());
    log.record_create(&shape(0.0));
    assert!(log.can_undo());
}

#[test]
fn nested_brackets_release_on_last_drop() {
    let log = HistoryLog::new(50);
    let outer = log.begin_replay();
    let inner = log.begin_replay();
    drop(inner);
    assert!(log.is_replaying());
    drop(outer);
    assert!(!log.is_replaying());
}

#[test]
fn revert_moves_entry_back() {
    let mut log = HistoryLog::new(50);
    log.record_create(&shape(0.0));

    let entry = log.undo().unwrap();
    log.revert_undo(entry);
    assert_eq!((log.undo_depth(), log.redo_depth()), (1, 0));

    log.undo().unwrap();
    let entry = log.redo().unwrap();
    log.revert_redo(entry);
    assert_eq!((log.undo_depth(), log.redo_depth()), (0, 1));
}

// =============================================================================
// replay against the entity client
// =============================================================================

fn client(remote: &MemoryEntityStore) -> EntityStoreClient {
    EntityStoreClient::new(Arc::new(remote.clone()), "alice", &SyncConfig::default())
}

#[tokio::test]
async fn undo_redo_create_round_trips() {
    let remote = MemoryEntityStore::new();
    let store = client(&remote);
    let mut log = HistoryLog::new(50);

    let created = store.create(ShapeDraft::ellipse(5.0, 5.0, 8.0, 8.0, "#e74c3c")).await.unwrap();
    log.record_create(&created);

    let entry = log.undo().unwrap();
    replay(&store, &entry, ReplayDirection::Undo).await.unwrap();
    assert!(store.get(created.id).is_none());
    assert!(remote.get(created.id).is_none());

    let entry = log.redo().unwrap();
    replay(&store, &entry, ReplayDirection::Redo).await.unwrap();
    assert!(store.get(created.id).unwrap().same_content(&created));
    assert!(remote.get(created.id).is_some());
}

#[tokio::test]
async fn undo_redo_update_round_trips() {
    let remote = MemoryEntityStore::new();
    let store = client(&remote);
    let mut log = HistoryLog::new(50);

    let before = store.create(ShapeDraft::text(0.0, 0.0, 80.0, 20.0, "draft", "#ffeb3b")).await.unwrap();
    let mut patch = ShapePatch::position(40.0, 40.0);
    patch.content = Some("final".into());
    patch.opacity = Some(Some(0.5));
    store.update(before.id, patch).await.unwrap();
    let after = store.get(before.id).unwrap();
    log.record_update(&before, &after);

    let entry = log.undo().unwrap();
    replay(&store, &entry, ReplayDirection::Undo).await.unwrap();
    assert!(store.get(before.id).unwrap().same_content(&before));

    let entry = log.redo().unwrap();
    replay(&store, &entry, ReplayDirection::Redo).await.unwrap();
    assert!(store.get(before.id).unwrap().same_content(&after));
}

#[tokio::test]
async fn undo_delete_restores_original_id() {
    let remote = MemoryEntityStore::new();
    let store = client(&remote);
    let mut log = HistoryLog::new(50);

    let shape = store.create(ShapeDraft::line(0.0, 0.0, 30.0, 30.0, "#000")).await.unwrap();
    store.delete(shape.id).await.unwrap();
    log.record_delete(&shape);

    let entry = log.undo().unwrap();
    replay(&store, &entry, ReplayDirection::Undo).await.unwrap();
    assert!(store.get(shape.id).unwrap().same_content(&shape));

    let entry = log.redo().unwrap();
    replay(&store, &entry, ReplayDirection::Redo).await.unwrap();
    assert!(store.get(shape.id).is_none());
}

#[tokio::test]
async fn failed_replay_reports_error() {
    let remote = MemoryEntityStore::new();
    let store = client(&remote);
    let mut log = HistoryLog::new(50);

    let shape = store.create(ShapeDraft::rectangle(0.0, 0.0, 5.0, 5.0, "#fff")).await.unwrap();
    store.delete(shape.id).await.unwrap();
    log.record_delete(&shape);

    remote.fail_next(EntityOp::Put, RemoteError::PermissionDenied("read-only board".into()));
    let entry = log.undo().unwrap();
    let err = replay(&store, &entry, ReplayDirection::Undo).await.unwrap_err();
    assert!(matches!(err, SyncError::PermissionDenied(_)));
    assert!(store.get(shape.id).is_none());

    log.revert_undo(entry);
    assert!(log.can_undo());
    assert!(!log.can_redo());
}
