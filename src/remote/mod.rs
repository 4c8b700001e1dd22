//! Remote collaborators: the durable entity store and the ephemeral store.
//!
//! ARCHITECTURE
//! ============
//! Both stores are external services; this module only fixes the seams the
//! sync core consumes. The entity store keeps one addressable document per
//! shape and pushes the full collection to subscribers whenever anything
//! changes. The ephemeral store is a low-latency key-value broadcast medium
//! with server-side disconnect hooks. The two share no types beyond
//! `RemoteError`, so an outage of one never reaches the other.
//!
//! `memory` provides in-process implementations with fault injection.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::shape::{Shape, ShapeId, ShapePatch};

// =============================================================================
// ERRORS
// =============================================================================

/// Failure taxonomy for remote calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The addressed record does not exist (usually deleted by another session).
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Transport-level failure; the same call may succeed later.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl crate::error::ErrorCode for RemoteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_REMOTE_NOT_FOUND",
            Self::PermissionDenied(_) => "E_REMOTE_PERMISSION_DENIED",
            Self::Unavailable(_) => "E_REMOTE_UNAVAILABLE",
            Self::Other(_) => "E_REMOTE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// ENTITY STORE
// =============================================================================

/// Push stream of full collection snapshots. An `Err` item ends the stream.
pub type SnapshotStream = mpsc::UnboundedReceiver<Result<Vec<Shape>, RemoteError>>;

/// Durable per-entity document store with push notification of changes.
#[async_trait]
pub trait RemoteEntityStore: Send + Sync {
    /// Write the full record under its id.
    async fn put(&self, shape: &Shape) -> Result<(), RemoteError>;

    /// Partial write. Fails with `NotFound` if the record does not exist.
    async fn patch(&self, id: ShapeId, patch: &ShapePatch) -> Result<(), RemoteError>;

    /// Delete. Fails with `NotFound` if the record does not exist.
    async fn remove(&self, id: ShapeId) -> Result<(), RemoteError>;

    /// Subscribe to the whole collection. The current snapshot is delivered
    /// first, then one snapshot per change.
    fn subscribe(&self) -> SnapshotStream;
}

// =============================================================================
// EPHEMERAL STORE
// =============================================================================

/// Address of one ephemeral record: a namespace (e.g. a board's cursor
/// space) and a key within it (e.g. a session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EphemeralKey {
    pub namespace: String,
    pub key: String,
}

impl EphemeralKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), key: key.into() }
    }
}

impl std::fmt::Display for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// All records in one namespace, keyed by record key.
pub type NamespaceSnapshot = BTreeMap<String, Value>;

/// Push stream of namespace snapshots. An `Err` item ends the stream.
pub type NamespaceStream = mpsc::UnboundedReceiver<Result<NamespaceSnapshot, RemoteError>>;

/// Write the server performs on the client's behalf once it detects the
/// client's transport has gone away.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectAction {
    Remove(EphemeralKey),
    /// Write `value`; if `stamp_field` is set, the server overwrites that
    /// field with its own clock (ms since epoch) at execution time.
    Write {
        key: EphemeralKey,
        value: Value,
        stamp_field: Option<&'static str>,
    },
}

impl DisconnectAction {
    #[must_use]
    pub fn key(&self) -> &EphemeralKey {
        match self {
            Self::Remove(key) | Self::Write { key, .. } => key,
        }
    }
}

/// Low-latency key-value broadcast medium bound to one client connection.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &EphemeralKey, value: Value) -> Result<(), RemoteError>;

    /// Delete a record. Deleting a missing record succeeds.
    async fn remove(&self, key: &EphemeralKey) -> Result<(), RemoteError>;

    /// Subscribe to every record in `namespace`. The current contents are
    /// delivered first, then one snapshot per change.
    fn subscribe(&self, namespace: &str) -> NamespaceStream;

    /// Pre-register a server-side action for when this connection drops.
    /// A later registration for the same key replaces the earlier one.
    async fn on_disconnect(&self, action: DisconnectAction) -> Result<(), RemoteError>;
}
