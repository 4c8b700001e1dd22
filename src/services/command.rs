//! Command surface — typed shape commands from a command source.
//!
//! DESIGN
//! ======
//! A command source (natural-language interpreter, script, test fixture)
//! turns an intent into `ShapeCommand`s: the same payloads an LLM tool call
//! would carry. Commands run through the board session's recorded mutation
//! surface, so they land in undo history and respect soft locks held by
//! other users.
//!
//! Each command is executed independently. A failing command is reported
//! and the rest still run.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::services::entity::SyncError;
use crate::session::BoardSession;
use crate::shape::{Selector, ShapeDraft, ShapeId, ShapePatch};

// =============================================================================
// TYPES
// =============================================================================

/// What a command acts on: one shape by id, or every shape a selector matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Id(ShapeId),
    Select(Selector),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Select(selector) => write!(f, "{selector}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShapeCommand {
    Create(ShapeDraft),
    Move { target: Target, x: f64, y: f64 },
    Resize { target: Target, width: f64, height: f64 },
    Rotate { target: Target, degrees: f64 },
    Restyle {
        target: Target,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fill: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke: Option<String>,
    },
    SetText { target: Target, content: String },
    Delete { target: Target },
}

impl ShapeCommand {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Move { .. } => "move",
            Self::Resize { .. } => "resize",
            Self::Rotate { .. } => "rotate",
            Self::Restyle { .. } => "restyle",
            Self::SetText { .. } => "set_text",
            Self::Delete { .. } => "delete",
        }
    }

    fn target(&self) -> Option<&Target> {
        match self {
            Self::Create(_) => None,
            Self::Move { target, .. }
            | Self::Resize { target, .. }
            | Self::Rotate { target, .. }
            | Self::Restyle { target, .. }
            | Self::SetText { target, .. }
            | Self::Delete { target } => Some(target),
        }
    }

    /// The patch applied to each target, or `None` for create/delete.
    fn patch(&self) -> Option<ShapePatch> {
        let patch = match self {
            Self::Create(_) | Self::Delete { .. } => return None,
            Self::Move { x, y, .. } => ShapePatch::position(*x, *y),
            Self::Resize { width, height, .. } => ShapePatch::size(*width, *height),
            Self::Rotate { degrees, .. } => ShapePatch { rotation: Some(*degrees), ..ShapePatch::default() },
            Self::Restyle { fill, stroke, .. } => ShapePatch {
                fill: fill.clone(),
                stroke: stroke.clone().map(Some),
                ..ShapePatch::default()
            },
            Self::SetText { content, .. } => ShapePatch { content: Some(content.clone()), ..ShapePatch::default() },
        };
        Some(patch)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command source failed: {0}")]
    Source(String),
    #[error("no shape matches {0}")]
    NoMatch(String),
    #[error("shape {id} is locked by {holder}")]
    Locked { id: ShapeId, holder: String },
    #[error("selector has no criteria; set \"all\": true to target every shape")]
    Unbounded,
    #[error("nothing to change")]
    EmptyChange,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("malformed command: {0}")]
    Parse(#[from] serde_json::Error),
}

impl crate::error::ErrorCode for CommandError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Source(_) => "E_COMMAND_SOURCE",
            Self::NoMatch(_) => "E_NO_MATCH",
            Self::Locked { .. } => "E_LOCKED",
            Self::Unbounded => "E_UNBOUNDED_TARGET",
            Self::EmptyChange => "E_EMPTY_CHANGE",
            Self::Sync(e) => e.error_code(),
            Self::Parse(_) => "E_MALFORMED_COMMAND",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Sync(e) => e.retryable(),
            Self::Locked { .. } => true,
            _ => false,
        }
    }
}

/// Result of one command in a batch.
#[derive(Debug)]
pub struct CommandOutcome {
    pub op: &'static str,
    /// Shapes created or changed.
    pub result: Result<Vec<ShapeId>, CommandError>,
}

impl CommandOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Turns a user intent into shape commands.
#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn interpret(&self, intent: &str) -> Result<Vec<ShapeCommand>, CommandError>;
}

/// Parse a JSON command or array of commands.
///
/// # Errors
///
/// Returns `Parse` if the text is neither.
pub fn parse_commands(text: &str) -> Result<Vec<ShapeCommand>, CommandError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Treats the intent itself as JSON commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCommandSource;

#[async_trait]
impl CommandSource for JsonCommandSource {
    async fn interpret(&self, intent: &str) -> Result<Vec<ShapeCommand>, CommandError> {
        parse_commands(intent)
    }
}

/// Fixed intent → commands table.
#[derive(Debug, Default, Clone)]
pub struct ScriptedCommandSource {
    scripts: HashMap<String, Vec<ShapeCommand>>,
}

impl ScriptedCommandSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, intent: impl Into<String>, commands: Vec<ShapeCommand>) -> Self {
        self.scripts.insert(intent.into(), commands);
        self
    }
}

#[async_trait]
impl CommandSource for ScriptedCommandSource {
    async fn interpret(&self, intent: &str) -> Result<Vec<ShapeCommand>, CommandError> {
        self.scripts
            .get(intent.trim())
            .cloned()
            .ok_or_else(|| CommandError::Source(format!("no script for intent {intent:?}")))
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

/// Run one command against `session`. Returns the ids of the shapes it
/// created or changed.
///
/// Selector targets skip shapes locked by other users; an id target that is
/// locked, or a selector whose every match is locked, fails with `Locked`.
/// A selector with no criteria is refused unless it sets `all`.
///
/// # Errors
///
/// `Unbounded`, `NoMatch`, `Locked`, `EmptyChange`, or the first sync failure.
pub async fn execute_command(session: &BoardSession, command: &ShapeCommand) -> Result<Vec<ShapeId>, CommandError> {
    if let ShapeCommand::Create(draft) = command {
        let shape = session.create(draft.clone()).await?;
        info!(id = %shape.id, kind = %shape.kind(), "command: created");
        return Ok(vec![shape.id]);
    }

    let Some(target) = command.target() else {
        return Ok(Vec::new());
    };
    let ids = editable_targets(session, target)?;
    let patch = command.patch();
    if patch.as_ref().is_some_and(ShapePatch::is_empty) {
        return Err(CommandError::EmptyChange);
    }

    for id in &ids {
        match &patch {
            Some(patch) => session.update(*id, patch.clone()).await?,
            None => session.delete(*id).await?,
        }
    }
    info!(op = command.op(), %target, count = ids.len(), "command: applied");
    Ok(ids)
}

fn editable_targets(session: &BoardSession, target: &Target) -> Result<Vec<ShapeId>, CommandError> {
    let user = &session.identity().user_id;
    let candidates = match target {
        Target::Id(id) => session.entities().get(*id).into_iter().collect(),
        Target::Select(selector) if selector.is_unbounded() => return Err(CommandError::Unbounded),
        Target::Select(selector) => session.entities().find(selector),
    };
    if candidates.is_empty() {
        return Err(CommandError::NoMatch(target.to_string()));
    }

    let mut refused = None;
    let mut ids = Vec::with_capacity(candidates.len());
    for shape in candidates {
        if shape.editable_by(user) {
            ids.push(shape.id);
        } else {
            warn!(id = %shape.id, holder = ?shape.locked_by, "command: skipping locked shape");
            refused.get_or_insert((shape.id, shape.locked_by.unwrap_or_default()));
        }
    }
    match (ids.is_empty(), refused) {
        (true, Some((id, holder))) => Err(CommandError::Locked { id, holder }),
        _ => Ok(ids),
    }
}

#[cfg(test)]
#[path = "command_test.rs"]
mod tests;
