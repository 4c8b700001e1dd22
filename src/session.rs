//! Board session — one user's connection to one board.
//!
//! DESIGN
//! ======
//! The session is the application root. It builds and owns the entity
//! client, the cursor and presence channels, the undo history, and a handle
//! to the diagnostic log, and tears them down together in `leave`.
//!
//! User-originated mutations go through the session so they are recorded in
//! history. Undo/redo replays straight through the entity client, bypassing
//! the recording wrappers, so replayed mutations are not recorded again while
//! edits made during a slow replay still are. A replay that fails puts its
//! entry back where it came from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::diagnostics::DiagnosticLog;
use crate::helpers::color_for;
use crate::remote::{EphemeralStore, RemoteEntityStore};
use crate::services::command::{self, CommandError, CommandOutcome, CommandSource, ShapeCommand};
use crate::services::cursor::CursorChannel;
use crate::services::entity::{EntityStoreClient, SyncError};
use crate::services::history::{self, HistoryLog, ReplayDirection};
use crate::services::presence::PresenceChannel;
use crate::shape::{Shape, ShapeDraft, ShapeId, ShapePatch, UserId};

/// Who is connected: a stable user plus a per-connection session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub color: String,
}

impl Identity {
    /// New session for `user_id`, colored from the user palette.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = color_for(&user_id).to_owned();
        Self { session_id: Uuid::new_v4(), user_id, name: name.into(), color }
    }
}

/// The remote collaborators a session talks to.
#[derive(Clone)]
pub struct Remotes {
    pub entities: Arc<dyn RemoteEntityStore>,
    pub ephemeral: Arc<dyn EphemeralStore>,
}

pub struct BoardSession {
    board_id: String,
    identity: Identity,
    entities: EntityStoreClient,
    cursors: CursorChannel,
    presence: PresenceChannel,
    history: Mutex<HistoryLog>,
    drags: Mutex<HashMap<ShapeId, Shape>>,
    diagnostics: DiagnosticLog,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BoardSession {
    /// Connect to `board_id`: open the entity subscription and mount both
    /// ephemeral channels.
    pub async fn join(
        board_id: impl Into<String>,
        config: &SyncConfig,
        identity: Identity,
        remotes: Remotes,
        diagnostics: DiagnosticLog,
    ) -> Self {
        let board_id = board_id.into();
        let entities = EntityStoreClient::new(remotes.entities, identity.user_id.clone(), config);
        entities.activate();
        let cursors = CursorChannel::mount(Arc::clone(&remotes.ephemeral), &board_id, &identity, config).await;
        let presence = PresenceChannel::mount(remotes.ephemeral, &board_id, &identity, config).await;

        info!(%board_id, user_id = %identity.user_id, session_id = %identity.session_id, "session: joined");
        Self {
            board_id,
            identity,
            entities,
            cursors,
            presence,
            history: Mutex::new(HistoryLog::new(config.history_capacity)),
            drags: Mutex::new(HashMap::new()),
            diagnostics,
        }
    }

    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn entities(&self) -> &EntityStoreClient {
        &self.entities
    }

    #[must_use]
    pub fn cursors(&self) -> &CursorChannel {
        &self.cursors
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    // =========================================================================
    // RECORDED MUTATIONS
    // =========================================================================

    /// Create a shape and record it.
    ///
    /// # Errors
    ///
    /// Whatever the entity client's `create` returns.
    pub async fn create(&self, draft: ShapeDraft) -> Result<Shape, SyncError> {
        let shape = self.entities.create(draft).await?;
        locked(&self.history).record_create(&shape);
        Ok(shape)
    }

    /// Update a shape and record the before/after pair.
    ///
    /// # Errors
    ///
    /// Whatever the entity client's `update` returns.
    pub async fn update(&self, id: ShapeId, patch: ShapePatch) -> Result<(), SyncError> {
        let before = self.entities.get(id);
        self.entities.update(id, patch).await?;
        if let (Some(before), Some(after)) = (before, self.entities.get(id)) {
            locked(&self.history).record_update(&before, &after);
        }
        Ok(())
    }

    /// Delete a shape and record its last state.
    ///
    /// # Errors
    ///
    /// Whatever the entity client's `delete` returns.
    pub async fn delete(&self, id: ShapeId) -> Result<(), SyncError> {
        let before = self.entities.get(id);
        self.entities.delete(id).await?;
        locked(&self.drags).remove(&id);
        if let Some(before) = before {
            locked(&self.history).record_delete(&before);
        }
        Ok(())
    }

    /// Move a shape unless another user holds its lock. Returns whether it moved.
    ///
    /// # Errors
    ///
    /// Whatever the entity client's `update` returns.
    pub async fn move_shape(&self, id: ShapeId, x: f64, y: f64) -> Result<bool, SyncError> {
        let Some(shape) = self.entities.get(id) else {
            return Ok(false);
        };
        if !shape.editable_by(&self.identity.user_id) {
            debug!(%id, holder = ?shape.locked_by, "session: move refused, shape locked");
            return Ok(false);
        }
        self.update(id, ShapePatch::position(x, y)).await?;
        Ok(true)
    }

    // =========================================================================
    // DRAG
    // =========================================================================

    /// Take the soft lock on a shape for an interactive drag. Returns `false`
    /// if the shape is gone or locked by another user.
    ///
    /// # Errors
    ///
    /// Returns the lock's remote write failure.
    pub async fn begin_drag(&self, id: ShapeId) -> Result<bool, SyncError> {
        let Some(origin) = self.entities.get(id) else {
            return Ok(false);
        };
        if !origin.editable_by(&self.identity.user_id) {
            debug!(%id, holder = ?origin.locked_by, "session: drag refused, shape locked");
            return Ok(false);
        }
        self.entities.lock(id, self.identity.user_id.clone()).await?;
        locked(&self.drags).entry(id).or_insert(origin);
        Ok(true)
    }

    /// Intermediate drag position. Not recorded; `end_drag` records the
    /// whole gesture as one update.
    ///
    /// # Errors
    ///
    /// Whatever the entity client's `update` returns.
    pub async fn drag_to(&self, id: ShapeId, x: f64, y: f64) -> Result<(), SyncError> {
        if !locked(&self.drags).contains_key(&id) {
            warn!(%id, "session: drag_to without begin_drag");
            return Ok(());
        }
        self.entities.update(id, ShapePatch::position(x, y)).await
    }

    #[cfg(test)]
    pub(crate) fn drags_in_progress(&self) -> usize {
        locked(&self.drags).len()
    }

    /// Release the drag lock and record origin → final position.
    ///
    /// # Errors
    ///
    /// Returns the unlock's remote write failure. The gesture is recorded
    /// either way.
    pub async fn end_drag(&self, id: ShapeId) -> Result<(), SyncError> {
        let origin = locked(&self.drags).remove(&id);
        let Some(origin) = origin else {
            return Ok(());
        };
        let unlocked = self.entities.unlock(id).await;
        if let Some(after) = self.entities.get(id) {
            locked(&self.history).record_update(&origin, &after);
        }
        unlocked
    }

    // =========================================================================
    // UNDO / REDO
    // =========================================================================

    #[must_use]
    pub fn can_undo(&self) -> bool {
        locked(&self.history).can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        locked(&self.history).can_redo()
    }

    #[must_use]
    pub fn history_depths(&self) -> (usize, usize) {
        let history = locked(&self.history);
        (history.undo_depth(), history.redo_depth())
    }

    /// Revert the newest recorded mutation. Returns `false` if there is none.
    ///
    /// # Errors
    ///
    /// Returns the replay failure; the entry stays on the undo stack.
    pub async fn undo(&self) -> Result<bool, SyncError> {
        let next = locked(&self.history).undo();
        let Some(entry) = next else {
            return Ok(false);
        };
        let result = history::replay(&self.entities, &entry, ReplayDirection::Undo).await;
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(id = %entry.entity_id, error = %err, "session: undo failed");
                locked(&self.history).revert_undo(entry);
                Err(err)
            }
        }
    }

    /// Re-apply the newest undone mutation. Returns `false` if there is none.
    ///
    /// # Errors
    ///
    /// Returns the replay failure; the entry stays on the redo stack.
    pub async fn redo(&self) -> Result<bool, SyncError> {
        let next = locked(&self.history).redo();
        let Some(entry) = next else {
            return Ok(false);
        };
        let result = history::replay(&self.entities, &entry, ReplayDirection::Redo).await;
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(id = %entry.entity_id, error = %err, "session: redo failed");
                locked(&self.history).revert_redo(entry);
                Err(err)
            }
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Run each command in order. A failure is reported in its outcome and
    /// does not stop the batch.
    pub async fn execute(&self, commands: &[ShapeCommand]) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = command::execute_command(self, cmd).await;
            if let Err(err) = &result {
                warn!(op = cmd.op(), error = %err, "session: command failed");
            }
            outcomes.push(CommandOutcome { op: cmd.op(), result });
        }
        outcomes
    }

    /// Ask `source` to interpret `intent`, then execute the result.
    ///
    /// # Errors
    ///
    /// Returns the source's failure. Per-command failures are in the outcomes.
    pub async fn run_intent(&self, source: &dyn CommandSource, intent: &str) -> Result<Vec<CommandOutcome>, CommandError> {
        let commands = source.interpret(intent).await?;
        info!(count = commands.len(), "session: intent interpreted");
        Ok(self.execute(&commands).await)
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Leave the board: remove the cursor, go offline, stop sync, and drop
    /// undo history.
    pub async fn leave(&self) {
        self.cursors.shutdown().await;
        self.presence.shutdown().await;
        self.entities.shutdown();
        locked(&self.history).clear();
        locked(&self.drags).clear();
        info!(board_id = %self.board_id, session_id = %self.identity.session_id, "session: left");
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
