//! Client-side sync core for a collaborative whiteboard.
//!
//! A `BoardSession` joins one board: it mirrors the shared shapes through an
//! optimistic last-write-wins `EntityStoreClient`, publishes this user's
//! cursor and presence over an ephemeral store, and keeps a bounded
//! undo/redo history of the user's own mutations.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod helpers;
pub mod remote;
pub mod services;
pub mod session;
pub mod shape;

pub use config::SyncConfig;
pub use diagnostics::{DiagnosticLayer, DiagnosticLog};
pub use error::ErrorCode;
pub use services::command::{CommandSource, ShapeCommand, Target};
pub use services::entity::{EntityStoreClient, StoreView, SyncError};
pub use session::{BoardSession, Identity, Remotes};
pub use shape::{Shape, ShapeDraft, ShapeId, ShapePatch, Selector};
