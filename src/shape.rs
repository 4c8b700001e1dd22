//! Shape entities — the records mirrored between sessions.
//!
//! DESIGN
//! ======
//! Geometry is a tagged union over shape kind. Every kind exposes a uniform
//! anchor `(x, y)` and extent `(width, height)` so move and resize patches
//! apply the same way everywhere, while the field names on the wire say what
//! the numbers mean for that kind:
//!
//! - rectangle: top-left corner + size
//! - ellipse: center + diameters
//! - line: start point + delta to end
//! - text: top-left corner + box + content
//!
//! Shapes are validated at construction and after every patch, so an invalid
//! record never enters local state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a user as known to the auth layer.
pub type UserId = String;

// =============================================================================
// IDENTITY
// =============================================================================

/// Globally unique shape id, generated client-side and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(pub Uuid);

impl ShapeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ShapeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("{field} must be a finite number")]
    NonFinite { field: &'static str },
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("line must have a non-zero length")]
    DegenerateLine,
    #[error("fill color must not be empty")]
    EmptyFill,
    #[error("opacity must be within 0..=1, got {0}")]
    OpacityOutOfRange(f64),
    #[error("{field} does not apply to {kind} shapes")]
    NotApplicable { field: &'static str, kind: ShapeKind },
}

impl crate::error::ErrorCode for ShapeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NonFinite { .. } => "E_SHAPE_NON_FINITE",
            Self::NonPositive { .. } => "E_SHAPE_NON_POSITIVE",
            Self::DegenerateLine => "E_SHAPE_DEGENERATE_LINE",
            Self::EmptyFill => "E_SHAPE_EMPTY_FILL",
            Self::OpacityOutOfRange(_) => "E_SHAPE_OPACITY",
            Self::NotApplicable { .. } => "E_SHAPE_NOT_APPLICABLE",
        }
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ShapeError> {
    if value.is_finite() { Ok(()) } else { Err(ShapeError::NonFinite { field }) }
}

fn positive(field: &'static str, value: f64) -> Result<(), ShapeError> {
    finite(field, value)?;
    if value > 0.0 { Ok(()) } else { Err(ShapeError::NonPositive { field, value }) }
}

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Text,
}

impl ShapeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Ellipse => "ellipse",
            Self::Line => "line",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geometry {
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    Ellipse { cx: f64, cy: f64, width: f64, height: f64 },
    Line { x: f64, y: f64, dx: f64, dy: f64 },
    Text { x: f64, y: f64, width: f64, height: f64, content: String },
}

impl Geometry {
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::Rectangle { .. } => ShapeKind::Rectangle,
            Self::Ellipse { .. } => ShapeKind::Ellipse,
            Self::Line { .. } => ShapeKind::Line,
            Self::Text { .. } => ShapeKind::Text,
        }
    }

    /// Reference point: top-left for boxes, center for ellipses, start for lines.
    #[must_use]
    pub fn anchor(&self) -> (f64, f64) {
        match *self {
            Self::Rectangle { x, y, .. } | Self::Line { x, y, .. } | Self::Text { x, y, .. } => (x, y),
            Self::Ellipse { cx, cy, .. } => (cx, cy),
        }
    }

    /// Size for boxes and ellipses, delta-to-end for lines.
    #[must_use]
    pub fn extent(&self) -> (f64, f64) {
        match *self {
            Self::Rectangle { width, height, .. }
            | Self::Ellipse { width, height, .. }
            | Self::Text { width, height, .. } => (width, height),
            Self::Line { dx, dy, .. } => (dx, dy),
        }
    }

    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Text { content, .. } => Some(content),
            _ => None,
        }
    }

    fn set_anchor(&mut self, nx: Option<f64>, ny: Option<f64>) {
        let (ax, ay) = match self {
            Self::Rectangle { x, y, .. } | Self::Line { x, y, .. } | Self::Text { x, y, .. } => (x, y),
            Self::Ellipse { cx, cy, .. } => (cx, cy),
        };
        if let Some(v) = nx {
            *ax = v;
        }
        if let Some(v) = ny {
            *ay = v;
        }
    }

    fn set_extent(&mut self, nw: Option<f64>, nh: Option<f64>) {
        let (ew, eh) = match self {
            Self::Rectangle { width, height, .. }
            | Self::Ellipse { width, height, .. }
            | Self::Text { width, height, .. } => (width, height),
            Self::Line { dx, dy, .. } => (dx, dy),
        };
        if let Some(v) = nw {
            *ew = v;
        }
        if let Some(v) = nh {
            *eh = v;
        }
    }

    /// Validate kind-specific geometry rules.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ShapeError> {
        let (x, y) = self.anchor();
        finite("x", x)?;
        finite("y", y)?;
        match *self {
            Self::Line { dx, dy, .. } => {
                finite("dx", dx)?;
                finite("dy", dy)?;
                if dx == 0.0 && dy == 0.0 {
                    return Err(ShapeError::DegenerateLine);
                }
            }
            _ => {
                let (w, h) = self.extent();
                positive("width", w)?;
                positive("height", h)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// STYLE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub fill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

impl Style {
    #[must_use]
    pub fn fill(fill: impl Into<String>) -> Self {
        Self { fill: fill.into(), stroke: None, opacity: None }
    }

    fn validate(&self) -> Result<(), ShapeError> {
        if self.fill.trim().is_empty() {
            return Err(ShapeError::EmptyFill);
        }
        if let Some(opacity) = self.opacity {
            if !(0.0..=1.0).contains(&opacity) {
                return Err(ShapeError::OpacityOutOfRange(opacity));
            }
        }
        Ok(())
    }
}

// =============================================================================
// SHAPE
// =============================================================================

/// One drawable object in the shared collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(default)]
    pub rotation: f64,
    #[serde(flatten)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
    /// Creator. Ownership does not restrict editing.
    pub user_id: UserId,
    /// Soft-lock holder. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<UserId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Shape {
    /// Build a new shape from a draft with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns a `ShapeError` if the draft fails validation.
    pub fn from_draft(draft: ShapeDraft, user_id: impl Into<UserId>, now: i64) -> Result<Self, ShapeError> {
        let shape = Self {
            id: ShapeId::generate(),
            geometry: draft.geometry,
            rotation: draft.rotation,
            style: draft.style,
            z_index: draft.z_index,
            user_id: user_id.into(),
            locked_by: None,
            created_at: now,
            updated_at: now,
        };
        shape.validate()?;
        Ok(shape)
    }

    /// # Errors
    ///
    /// Returns the first violated geometry or style rule.
    pub fn validate(&self) -> Result<(), ShapeError> {
        self.geometry.validate()?;
        finite("rotation", self.rotation)?;
        self.style.validate()
    }

    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// The drag/edit permission check: free, or locked by `user` itself.
    #[must_use]
    pub fn editable_by(&self, user: &str) -> bool {
        self.locked_by.as_deref().is_none_or(|holder| holder == user)
    }

    /// Equal in everything a user edits, ignoring the update stamp and lock holder.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.geometry == other.geometry
            && self.rotation.to_bits() == other.rotation.to_bits()
            && self.style == other.style
            && self.z_index == other.z_index
            && self.user_id == other.user_id
            && self.created_at == other.created_at
    }
}

// =============================================================================
// DRAFT
// =============================================================================

/// Everything needed to create a shape except identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDraft {
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(default)]
    pub rotation: f64,
    #[serde(flatten)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

impl ShapeDraft {
    #[must_use]
    pub fn new(geometry: Geometry, fill: impl Into<String>) -> Self {
        Self { geometry, rotation: 0.0, style: Style::fill(fill), z_index: None }
    }

    #[must_use]
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64, fill: impl Into<String>) -> Self {
        Self::new(Geometry::Rectangle { x, y, width, height }, fill)
    }

    #[must_use]
    pub fn ellipse(cx: f64, cy: f64, width: f64, height: f64, fill: impl Into<String>) -> Self {
        Self::new(Geometry::Ellipse { cx, cy, width, height }, fill)
    }

    #[must_use]
    pub fn line(x: f64, y: f64, dx: f64, dy: f64, stroke: impl Into<String>) -> Self {
        let stroke = stroke.into();
        let mut draft = Self::new(Geometry::Line { x, y, dx, dy }, stroke.clone());
        draft.style.stroke = Some(stroke);
        draft
    }

    #[must_use]
    pub fn text(x: f64, y: f64, width: f64, height: f64, content: impl Into<String>, fill: impl Into<String>) -> Self {
        Self::new(Geometry::Text { x, y, width, height, content: content.into() }, fill)
    }

    #[must_use]
    pub fn with_stroke(mut self, stroke: impl Into<String>) -> Self {
        self.style.stroke = Some(stroke.into());
        self
    }

    #[must_use]
    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.style.opacity = Some(opacity);
        self
    }

    #[must_use]
    pub fn with_rotation(mut self, degrees: f64) -> Self {
        self.rotation = degrees;
        self
    }

    #[must_use]
    pub fn with_z_index(mut self, z_index: i32) -> Self {
        self.z_index = Some(z_index);
        self
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Partial update. `None` leaves a field untouched; for clearable fields the
/// inner `Option` distinguishes set from clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<f64>,
    pub fill: Option<String>,
    pub stroke: Option<Option<String>>,
    pub opacity: Option<Option<f64>>,
    pub z_index: Option<Option<i32>>,
    pub content: Option<String>,
    pub lock: Option<Option<UserId>>,
    pub updated_at: Option<i64>,
}

impl ShapePatch {
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    #[must_use]
    pub fn size(width: f64, height: f64) -> Self {
        Self { width: Some(width), height: Some(height), ..Self::default() }
    }

    #[must_use]
    pub fn lock(holder: impl Into<UserId>) -> Self {
        Self { lock: Some(Some(holder.into())), ..Self::default() }
    }

    #[must_use]
    pub fn unlock() -> Self {
        Self { lock: Some(None), ..Self::default() }
    }

    /// Every user-editable field of `shape`. Used to re-apply a recorded state.
    #[must_use]
    pub fn from_shape(shape: &Shape) -> Self {
        let (x, y) = shape.geometry.anchor();
        let (width, height) = shape.geometry.extent();
        Self {
            x: Some(x),
            y: Some(y),
            width: Some(width),
            height: Some(height),
            rotation: Some(shape.rotation),
            fill: Some(shape.style.fill.clone()),
            stroke: Some(shape.style.stroke.clone()),
            opacity: Some(shape.style.opacity),
            z_index: Some(shape.z_index),
            content: shape.geometry.content().map(str::to_owned),
            lock: None,
            updated_at: None,
        }
    }

    #[must_use]
    pub fn stamped(mut self, at: i64) -> Self {
        self.updated_at = Some(at);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when the patch only moves the lock (and its stamp).
    #[cfg(test)]
    pub(crate) fn is_lock_only(&self) -> bool {
        self.lock.is_some() && Self { lock: None, updated_at: None, ..self.clone() }.is_empty()
    }

    /// Apply onto `shape`, leaving it untouched if the result would be invalid.
    ///
    /// # Errors
    ///
    /// Returns `NotApplicable` for text content on non-text shapes, or the
    /// validation error of the patched result.
    pub fn apply(&self, shape: &mut Shape) -> Result<(), ShapeError> {
        let mut next = shape.clone();
        next.geometry.set_anchor(self.x, self.y);
        next.geometry.set_extent(self.width, self.height);
        if let Some(content) = &self.content {
            match &mut next.geometry {
                Geometry::Text { content: current, .. } => current.clone_from(content),
                other => return Err(ShapeError::NotApplicable { field: "content", kind: other.kind() }),
            }
        }
        if let Some(rotation) = self.rotation {
            next.rotation = rotation;
        }
        if let Some(fill) = &self.fill {
            next.style.fill.clone_from(fill);
        }
        if let Some(stroke) = &self.stroke {
            next.style.stroke.clone_from(stroke);
        }
        if let Some(opacity) = self.opacity {
            next.style.opacity = opacity;
        }
        if let Some(z_index) = self.z_index {
            next.z_index = z_index;
        }
        if let Some(lock) = &self.lock {
            next.locked_by.clone_from(lock);
        }
        if let Some(updated_at) = self.updated_at {
            next.updated_at = updated_at;
        }
        next.validate()?;
        *shape = next;
        Ok(())
    }
}

// =============================================================================
// SELECTOR
// =============================================================================

/// Matches shapes by kind, fill color, and/or text content. Empty matches all.
///
/// Unknown keys are rejected so a misspelled criterion cannot widen the match.
/// Commands additionally refuse an empty selector unless `all` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ShapeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
}

impl Selector {
    /// Selector that explicitly matches every shape.
    #[must_use]
    pub fn every() -> Self {
        Self { all: true, ..Self::default() }
    }

    /// No criteria and no explicit `all`.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.kind.is_none() && self.fill.is_none() && self.text.is_none() && !self.all
    }

    #[must_use]
    pub fn matches(&self, shape: &Shape) -> bool {
        if self.kind.is_some_and(|kind| kind != shape.kind()) {
            return false;
        }
        if let Some(fill) = &self.fill {
            if !shape.style.fill.eq_ignore_ascii_case(fill) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let found = shape
                .geometry
                .content()
                .is_some_and(|content| content.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(kind) = self.kind {
            parts.push(format!("kind={kind}"));
        }
        if let Some(fill) = &self.fill {
            parts.push(format!("fill={fill}"));
        }
        if let Some(text) = &self.text {
            parts.push(format!("text~{text}"));
        }
        if parts.is_empty() && self.all {
            return f.write_str("every shape");
        }
        if parts.is_empty() { f.write_str("any shape") } else { f.write_str(&parts.join(" ")) }
    }
}

#[cfg(test)]
#[path = "shape_test.rs"]
mod tests;
