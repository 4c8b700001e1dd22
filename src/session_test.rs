use super::*;
use crate::remote::memory::{EntityOp, MemoryEntityStore, MemoryEphemeralHub};
use crate::remote::{EphemeralKey, RemoteError};
use crate::services::cursor::cursor_namespace;
use crate::services::presence::{PresenceDisplay, presence_namespace};
use crate::remote::SnapshotStream;
use std::time::Duration;

const BOARD: &str = "board-1";

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Entity store whose deletes take `delay` to complete.
struct SlowRemoveStore {
    inner: MemoryEntityStore,
    delay: Duration,
}

#[async_trait::async_trait]
impl RemoteEntityStore for SlowRemoveStore {
    async fn put(&self, shape: &Shape) -> Result<(), RemoteError> {
        self.inner.put(shape).await
    }

    async fn patch(&self, id: ShapeId, patch: &ShapePatch) -> Result<(), RemoteError> {
        self.inner.patch(id, patch).await
    }

    async fn remove(&self, id: ShapeId) -> Result<(), RemoteError> {
        tokio::time::sleep(self.delay).await;
        self.inner.remove(id).await
    }

    fn subscribe(&self) -> SnapshotStream {
        self.inner.subscribe()
    }
}

async fn join(entities: &MemoryEntityStore, hub: &MemoryEphemeralHub, user: &str) -> BoardSession {
    let remotes = Remotes { entities: Arc::new(entities.clone()), ephemeral: Arc::new(hub.connect()) };
    let session = BoardSession::join(
        BOARD,
        &SyncConfig::default(),
        Identity::new(user, user.to_uppercase()),
        remotes,
        DiagnosticLog::new(50),
    )
    .await;
    settle().await;
    session
}

fn rect(x: f64) -> ShapeDraft {
    ShapeDraft::rectangle(x, 10.0, 40.0, 30.0, "#3498db")
}

#[test]
fn identity_color_is_stable_per_user() {
    let a = Identity::new("alice", "Alice");
    let b = Identity::new("alice", "Alice again");
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.color, b.color);
}

#[tokio::test]
async fn join_wires_every_component() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    assert!(!session.entities().is_loading());
    assert_eq!(session.board_id(), BOARD);
    let presence_key = EphemeralKey::new(presence_namespace(BOARD), session.identity().session_id.to_string());
    assert_eq!(hub.value(&presence_key).unwrap()["status"], "online");
    assert_eq!(session.presence().roster()[0].status, PresenceDisplay::Active);
    assert!(!session.can_undo());
}

// =============================================================================
// history
// =============================================================================

#[tokio::test]
async fn undo_then_redo_is_inverse() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    let keep = session.create(rect(0.0)).await.unwrap();
    let gone = session.create(ShapeDraft::ellipse(50.0, 50.0, 20.0, 20.0, "#e74c3c")).await.unwrap();
    session.update(keep.id, ShapePatch::position(100.0, 100.0)).await.unwrap();
    session.delete(gone.id).await.unwrap();
    let final_state = session.entities().shapes();
    assert_eq!(session.history_depths(), (4, 0));

    for _ in 0..4 {
        assert!(session.undo().await.unwrap());
    }
    assert!(!session.undo().await.unwrap());
    assert!(session.entities().shapes().is_empty());
    assert_eq!(session.history_depths(), (0, 4));

    for _ in 0..4 {
        assert!(session.redo().await.unwrap());
    }
    assert!(!session.redo().await.unwrap());
    let redone = session.entities().shapes();
    assert_eq!(redone.len(), final_state.len());
    for (a, b) in redone.iter().zip(&final_state) {
        assert!(a.same_content(b));
    }
    assert_eq!(session.history_depths(), (4, 0));
}

#[tokio::test]
async fn replay_is_not_recorded_again() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    let shape = session.create(rect(0.0)).await.unwrap();
    session.update(shape.id, ShapePatch::size(80.0, 80.0)).await.unwrap();
    session.undo().await.unwrap();
    assert_eq!(session.history_depths(), (1, 1));
    assert_eq!(session.entities().get(shape.id).unwrap().geometry.extent(), (40.0, 30.0));
}

#[tokio::test(start_paused = true)]
async fn edits_during_slow_undo_are_recorded() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let remote = SlowRemoveStore { inner: entities.clone(), delay: Duration::from_millis(50) };
    let remotes = Remotes { entities: Arc::new(remote), ephemeral: Arc::new(hub.connect()) };
    let session =
        BoardSession::join(BOARD, &SyncConfig::default(), Identity::new("alice", "Alice"), remotes, DiagnosticLog::new(50))
            .await;
    settle().await;

    let first = session.create(rect(0.0)).await.unwrap();
    let (undone, second) = tokio::join!(session.undo(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.create(rect(9.0)).await
    });
    assert!(undone.unwrap());
    let second = second.unwrap();
    settle().await;

    assert_eq!(session.history_depths(), (1, 0));
    assert!(session.entities().get(first.id).is_none());
    assert!(session.entities().get(second.id).is_some());
    assert!(session.undo().await.unwrap());
    assert!(session.entities().get(second.id).is_none());
}

#[tokio::test]
async fn fresh_mutation_clears_redo() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    session.create(rect(0.0)).await.unwrap();
    session.undo().await.unwrap();
    assert!(session.can_redo());
    session.create(rect(5.0)).await.unwrap();
    assert!(!session.can_redo());
}

#[tokio::test]
async fn failed_undo_keeps_entry_on_undo_stack() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    let shape = session.create(rect(0.0)).await.unwrap();
    entities.fail_next(EntityOp::Remove, RemoteError::PermissionDenied("locked board".into()));
    assert!(session.undo().await.is_err());
    assert_eq!(session.history_depths(), (1, 0));
    assert!(session.entities().get(shape.id).is_some());

    assert!(session.undo().await.unwrap());
    assert!(session.entities().get(shape.id).is_none());
}

#[tokio::test]
async fn failed_mutations_are_not_recorded() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    entities.fail_next(EntityOp::Put, RemoteError::Unavailable("offline".into()));
    assert!(session.create(rect(0.0)).await.is_err());
    assert!(!session.can_undo());
}

// =============================================================================
// drag and locks
// =============================================================================

#[tokio::test]
async fn drag_locks_out_other_sessions_and_records_one_update() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let alice = join(&entities, &hub, "alice").await;
    let bob = join(&entities, &hub, "bob").await;

    let shape = alice.create(rect(0.0)).await.unwrap();
    assert!(alice.begin_drag(shape.id).await.unwrap());
    settle().await;

    assert!(!bob.begin_drag(shape.id).await.unwrap());
    assert!(!bob.move_shape(shape.id, 999.0, 999.0).await.unwrap());

    alice.drag_to(shape.id, 20.0, 20.0).await.unwrap();
    alice.drag_to(shape.id, 60.0, 70.0).await.unwrap();
    alice.end_drag(shape.id).await.unwrap();
    settle().await;

    assert_eq!(alice.history_depths(), (2, 0));
    let released = bob.entities().get(shape.id).unwrap();
    assert!(!released.is_locked());
    assert_eq!(released.geometry.anchor(), (60.0, 70.0));
    assert!(bob.move_shape(shape.id, 1.0, 1.0).await.unwrap());

    // Alice's undo restores the drag origin, overwriting Bob's move (LWW).
    settle().await;
    alice.undo().await.unwrap();
    assert!(alice.undo().await.unwrap());
    assert!(alice.entities().get(shape.id).is_none());
}

#[tokio::test]
async fn deleting_dragged_shape_drops_its_origin() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;
    let shape = session.create(rect(0.0)).await.unwrap();

    assert!(session.begin_drag(shape.id).await.unwrap());
    assert_eq!(session.drags_in_progress(), 1);
    session.delete(shape.id).await.unwrap();
    assert_eq!(session.drags_in_progress(), 0);

    session.end_drag(shape.id).await.unwrap();
    assert_eq!(session.history_depths(), (2, 0));
}

#[tokio::test]
async fn drag_of_missing_shape_is_refused() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;
    assert!(!session.begin_drag(ShapeId::generate()).await.unwrap());
    session.end_drag(ShapeId::generate()).await.unwrap();
}

// =============================================================================
// commands and teardown
// =============================================================================

#[tokio::test]
async fn execute_reports_each_command() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;

    let commands = vec![
        ShapeCommand::Create(rect(0.0)),
        ShapeCommand::Delete { target: crate::services::command::Target::Id(ShapeId::generate()) },
        ShapeCommand::Create(ShapeDraft::text(0.0, 0.0, 100.0, 20.0, "hello", "#ffeb3b")),
    ];
    let outcomes = session.execute(&commands).await;
    let ok: Vec<bool> = outcomes.iter().map(CommandOutcome::is_ok).collect();
    assert_eq!(ok, vec![true, false, true]);
    assert_eq!(outcomes[1].op, "delete");
    assert_eq!(session.entities().shapes().len(), 2);
    assert_eq!(session.history_depths(), (2, 0));
}

#[tokio::test]
async fn leave_tears_everything_down() {
    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let session = join(&entities, &hub, "alice").await;
    let shape = session.create(rect(0.0)).await.unwrap();
    session.begin_drag(shape.id).await.unwrap();
    session.cursors().update_cursor(3.0, 4.0).await.unwrap();

    session.leave().await;
    settle().await;

    let sid = session.identity().session_id.to_string();
    assert!(hub.value(&EphemeralKey::new(cursor_namespace(BOARD), &sid)).is_none());
    assert_eq!(hub.value(&EphemeralKey::new(presence_namespace(BOARD), &sid)).unwrap()["status"], "offline");
    assert_eq!(session.entities().pending_lock_timers(), 0);
    assert_eq!(entities.subscriber_count(), 0);
    assert!(!session.can_undo());
}
