use super::*;

fn rect() -> Shape {
    Shape::from_draft(ShapeDraft::rectangle(100.0, 200.0, 150.0, 100.0, "#3498db"), "alice", 1_000).unwrap()
}

// =============================================================================
// construction
// =============================================================================

#[test]
fn from_draft_assigns_identity_and_timestamps() {
    let shape = rect();
    assert_eq!(shape.kind(), ShapeKind::Rectangle);
    assert_eq!(shape.geometry.anchor(), (100.0, 200.0));
    assert_eq!(shape.geometry.extent(), (150.0, 100.0));
    assert_eq!(shape.style.fill, "#3498db");
    assert_eq!(shape.user_id, "alice");
    assert_eq!(shape.created_at, 1_000);
    assert_eq!(shape.updated_at, 1_000);
    assert!(!shape.is_locked());
}

#[test]
fn from_draft_generates_distinct_ids() {
    assert_ne!(rect().id, rect().id);
}

#[test]
fn from_draft_rejects_non_positive_size() {
    let err = Shape::from_draft(ShapeDraft::ellipse(0.0, 0.0, 0.0, 10.0, "#fff"), "u", 0).unwrap_err();
    assert!(matches!(err, ShapeError::NonPositive { field: "width", .. }));
}

#[test]
fn from_draft_rejects_degenerate_line_and_nan() {
    let err = Shape::from_draft(ShapeDraft::line(5.0, 5.0, 0.0, 0.0, "#000"), "u", 0).unwrap_err();
    assert_eq!(err, ShapeError::DegenerateLine);

    let err = Shape::from_draft(ShapeDraft::rectangle(f64::NAN, 0.0, 1.0, 1.0, "#000"), "u", 0).unwrap_err();
    assert_eq!(err, ShapeError::NonFinite { field: "x" });
}

#[test]
fn line_accepts_negative_delta() {
    let shape = Shape::from_draft(ShapeDraft::line(10.0, 10.0, -5.0, 0.0, "#111"), "u", 0).unwrap();
    assert_eq!(shape.geometry.extent(), (-5.0, 0.0));
    assert_eq!(shape.style.stroke.as_deref(), Some("#111"));
}

#[test]
fn from_draft_rejects_empty_fill_and_bad_opacity() {
    let err = Shape::from_draft(ShapeDraft::rectangle(0.0, 0.0, 1.0, 1.0, "  "), "u", 0).unwrap_err();
    assert_eq!(err, ShapeError::EmptyFill);

    let draft = ShapeDraft::rectangle(0.0, 0.0, 1.0, 1.0, "#abc").with_opacity(1.5);
    let err = Shape::from_draft(draft, "u", 0).unwrap_err();
    assert_eq!(err, ShapeError::OpacityOutOfRange(1.5));
}

// =============================================================================
// locking
// =============================================================================

#[test]
fn editable_by_honors_lock_holder() {
    let mut shape = rect();
    assert!(shape.editable_by("bob"));
    shape.locked_by = Some("alice".into());
    assert!(shape.editable_by("alice"));
    assert!(!shape.editable_by("bob"));
}

// =============================================================================
// patches
// =============================================================================

#[test]
fn patch_position_leaves_other_fields() {
    let mut shape = rect();
    ShapePatch::position(150.0, 250.0).apply(&mut shape).unwrap();
    assert_eq!(shape.geometry.anchor(), (150.0, 250.0));
    assert_eq!(shape.geometry.extent(), (150.0, 100.0));
    assert_eq!(shape.style.fill, "#3498db");
}

#[test]
fn patch_moves_ellipse_center_and_line_start() {
    let mut ellipse = Shape::from_draft(ShapeDraft::ellipse(50.0, 50.0, 20.0, 20.0, "#f00"), "u", 0).unwrap();
    ShapePatch::position(60.0, 70.0).apply(&mut ellipse).unwrap();
    assert!(matches!(ellipse.geometry, Geometry::Ellipse { cx, cy, .. } if cx == 60.0 && cy == 70.0));

    let mut line = Shape::from_draft(ShapeDraft::line(0.0, 0.0, 10.0, 10.0, "#000"), "u", 0).unwrap();
    ShapePatch::size(3.0, 4.0).apply(&mut line).unwrap();
    assert!(matches!(line.geometry, Geometry::Line { dx, dy, .. } if dx == 3.0 && dy == 4.0));
}

#[test]
fn invalid_patch_leaves_shape_untouched() {
    let mut shape = rect();
    let before = shape.clone();
    let err = ShapePatch::size(-1.0, 10.0).apply(&mut shape).unwrap_err();
    assert!(matches!(err, ShapeError::NonPositive { field: "width", .. }));
    assert_eq!(shape, before);
}

#[test]
fn content_patch_only_applies_to_text() {
    let mut shape = rect();
    let patch = ShapePatch { content: Some("hi".into()), ..ShapePatch::default() };
    let err = patch.apply(&mut shape).unwrap_err();
    assert_eq!(err, ShapeError::NotApplicable { field: "content", kind: ShapeKind::Rectangle });

    let mut text = Shape::from_draft(ShapeDraft::text(0.0, 0.0, 80.0, 20.0, "old", "#fff"), "u", 0).unwrap();
    patch.apply(&mut text).unwrap();
    assert_eq!(text.geometry.content(), Some("hi"));
}

#[test]
fn clearable_fields_distinguish_set_from_clear() {
    let mut shape = Shape::from_draft(
        ShapeDraft::rectangle(0.0, 0.0, 1.0, 1.0, "#fff").with_stroke("#000").with_z_index(3),
        "u",
        0,
    )
    .unwrap();
    let patch = ShapePatch { stroke: Some(None), z_index: Some(None), ..ShapePatch::default() };
    patch.apply(&mut shape).unwrap();
    assert!(shape.style.stroke.is_none());
    assert!(shape.z_index.is_none());
}

#[test]
fn from_shape_round_trips_editable_state() {
    let original = rect();
    let mut moved = original.clone();
    ShapePatch { fill: Some("#000".into()), ..ShapePatch::position(1.0, 2.0) }
        .apply(&mut moved)
        .unwrap();
    ShapePatch::from_shape(&original).apply(&mut moved).unwrap();
    assert!(moved.same_content(&original));
}

#[test]
fn lock_only_detection() {
    assert!(ShapePatch::lock("a").stamped(5).is_lock_only());
    assert!(ShapePatch::unlock().is_lock_only());
    assert!(!ShapePatch { lock: Some(None), ..ShapePatch::position(0.0, 0.0) }.is_lock_only());
    assert!(ShapePatch::default().is_empty());
}

#[test]
fn same_content_ignores_stamp_and_lock() {
    let a = rect();
    let mut b = a.clone();
    b.updated_at += 10;
    b.locked_by = Some("bob".into());
    assert!(a.same_content(&b));
    b.rotation = 45.0;
    assert!(!a.same_content(&b));
}

// =============================================================================
// serde
// =============================================================================

#[test]
fn shape_serializes_with_kind_tag_and_flat_fields() {
    let shape = rect();
    let json = serde_json::to_value(&shape).unwrap();
    assert_eq!(json["kind"], "rectangle");
    assert_eq!(json["width"], 150.0);
    assert_eq!(json["fill"], "#3498db");
    assert!(json.get("locked_by").is_none());

    let restored: Shape = serde_json::from_value(json).unwrap();
    assert_eq!(restored, shape);
}

#[test]
fn draft_deserializes_from_tool_payload() {
    let draft: ShapeDraft = serde_json::from_str(
        r##"{"kind":"text","x":10,"y":20,"width":100,"height":30,"content":"Hello","fill":"#ffeb3b"}"##,
    )
    .unwrap();
    assert_eq!(draft.geometry.kind(), ShapeKind::Text);
    assert_eq!(draft.geometry.content(), Some("Hello"));
    assert!(draft.rotation.abs() < f64::EPSILON);
}

// =============================================================================
// selectors
// =============================================================================

#[test]
fn selector_matches_kind_fill_and_text() {
    let shape = rect();
    assert!(Selector::default().matches(&shape));
    assert!(Selector { kind: Some(ShapeKind::Rectangle), fill: Some("#3498DB".into()), text: None, all: false }.matches(&shape));
    assert!(!Selector { kind: Some(ShapeKind::Ellipse), ..Selector::default() }.matches(&shape));

    let note = Shape::from_draft(ShapeDraft::text(0.0, 0.0, 50.0, 20.0, "Launch Plan", "#fff"), "u", 0).unwrap();
    assert!(Selector { text: Some("launch".into()), ..Selector::default() }.matches(&note));
    assert!(!Selector { text: Some("launch".into()), ..Selector::default() }.matches(&shape));
}

#[test]
fn selector_display_lists_criteria() {
    assert_eq!(Selector::default().to_string(), "any shape");
    let s = Selector { kind: Some(ShapeKind::Line), fill: None, text: Some("x".into()), all: false };
    assert_eq!(s.to_string(), "kind=line text~x");
}

#[test]
fn selector_rejects_unknown_keys() {
    let err = serde_json::from_str::<Selector>(r#"{"id": "6f1c1c5e-8d8f-4b0e-9a53-2a6a3c1f6d11"}"#);
    assert!(err.is_err());
    let every: Selector = serde_json::from_str(r#"{"all": true}"#).unwrap();
    assert_eq!(every, Selector::every());
    assert_eq!(every.to_string(), "every shape");
}

#[test]
fn empty_selector_is_unbounded_unless_all() {
    assert!(Selector::default().is_unbounded());
    assert!(!Selector::every().is_unbounded());
    assert!(!Selector { fill: Some("#fff".into()), ..Selector::default() }.is_unbounded());
}
