//! Two sessions collaborating on one board over the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use collaboard_sync::remote::memory::{MemoryEntityStore, MemoryEphemeralHub};
use collaboard_sync::services::command::{ScriptedCommandSource, ShapeCommand, Target};
use collaboard_sync::{BoardSession, DiagnosticLayer, DiagnosticLog, Identity, Remotes, Selector, ShapeDraft, SyncConfig};

const BOARD_ID: &str = "demo-board";

#[tokio::main]
async fn main() {
    let config = SyncConfig::from_env();
    let diagnostics = DiagnosticLog::from_config(&config).expect("diagnostic log unavailable");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(DiagnosticLayer::new(diagnostics.clone()))
        .init();

    let entities = MemoryEntityStore::new();
    let hub = MemoryEphemeralHub::new();
    let bob_conn = hub.connect();

    let alice = BoardSession::join(
        BOARD_ID,
        &config,
        Identity::new("alice", "Alice"),
        Remotes { entities: Arc::new(entities.clone()), ephemeral: Arc::new(hub.connect()) },
        diagnostics.clone(),
    )
    .await;
    let bob = BoardSession::join(
        BOARD_ID,
        &config,
        Identity::new("bob", "Bob"),
        Remotes { entities: Arc::new(entities.clone()), ephemeral: Arc::new(bob_conn.clone()) },
        diagnostics.clone(),
    )
    .await;

    // Alice asks for a small layout.
    let source = ScriptedCommandSource::new().with(
        "draw a traffic light",
        vec![
            ShapeCommand::Create(ShapeDraft::rectangle(100.0, 100.0, 60.0, 180.0, "#34495e")),
            ShapeCommand::Create(ShapeDraft::ellipse(130.0, 130.0, 40.0, 40.0, "#e74c3c")),
            ShapeCommand::Create(ShapeDraft::ellipse(130.0, 190.0, 40.0, 40.0, "#f39c12")),
            ShapeCommand::Create(ShapeDraft::ellipse(130.0, 250.0, 40.0, 40.0, "#2ecc71")),
            ShapeCommand::Create(ShapeDraft::text(100.0, 300.0, 120.0, 24.0, "traffic light", "#ffffff")),
        ],
    );
    match alice.run_intent(&source, "draw a traffic light").await {
        Ok(outcomes) => info!(ok = outcomes.iter().filter(|o| o.is_ok()).count(), "demo: layout drawn"),
        Err(err) => warn!(error = %err, "demo: intent failed"),
    }
    settle().await;
    info!(shapes = bob.entities().shapes().len(), "demo: bob sees shapes");

    // Both cursors wander around the frame.
    for (x, y) in jitter(20, (130.0, 190.0)) {
        if let Err(err) = alice.cursors().update_cursor(x, y).await {
            warn!(error = %err, "demo: cursor write failed");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    settle().await;
    for (session_id, cursor) in bob.cursors().active_cursors() {
        info!(%session_id, name = %cursor.name, x = cursor.x, y = cursor.y, "demo: bob sees cursor");
    }

    // Alice drags the frame; Bob is refused while her lock is held.
    let frame = alice
        .entities()
        .find(&Selector { fill: Some("#34495e".into()), ..Selector::default() })
        .into_iter()
        .next();
    if let Some(frame) = frame {
        if alice.begin_drag(frame.id).await.unwrap_or(false) {
            settle().await;
            let moved = bob.move_shape(frame.id, 0.0, 0.0).await.unwrap_or(false);
            info!(moved, "demo: bob tried to move the locked frame");
            for step in 1..=5 {
                let offset = f64::from(step) * 10.0;
                if let Err(err) = alice.drag_to(frame.id, 100.0 + offset, 100.0 + offset).await {
                    warn!(error = %err, "demo: drag step failed");
                }
            }
            if let Err(err) = alice.end_drag(frame.id).await {
                warn!(error = %err, "demo: release failed");
            }
        }
    }

    // Bob recolors every light, then undoes and redoes it.
    let recolor = vec![ShapeCommand::Restyle {
        target: Target::Select(Selector { kind: Some(collaboard_sync::shape::ShapeKind::Ellipse), ..Selector::default() }),
        fill: Some("#9b59b6".into()),
        stroke: None,
    }];
    bob.execute(&recolor).await;
    for _ in 0..3 {
        if let Err(err) = bob.undo().await {
            warn!(error = %err, "demo: undo failed");
        }
    }
    info!(depths = ?bob.history_depths(), "demo: bob undid his recolor");
    if let Err(err) = bob.redo().await {
        warn!(error = %err, "demo: redo failed");
    }

    // Bob's transport dies; the server-side hooks clean up after him.
    let hooks = bob_conn.disconnect();
    settle().await;
    for row in alice.presence().roster() {
        info!(name = %row.name, status = ?row.status, "demo: roster");
    }
    info!(hooks, cursors = alice.cursors().active_cursors().len(), "demo: bob disconnected");

    alice.leave().await;
    bob.leave().await;
    info!(entries = diagnostics.len(), "demo: diagnostic log");
}

fn jitter(count: usize, center: (f64, f64)) -> Vec<(f64, f64)> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| (center.0 + rng.random_range(-25.0..25.0), center.1 + rng.random_range(-25.0..25.0)))
        .collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
