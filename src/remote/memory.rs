//! In-process remote stores.
//!
//! DESIGN
//! ======
//! `MemoryEntityStore` stands in for the durable document store and
//! `MemoryEphemeralHub` for the ephemeral store's server side. Both notify
//! subscribers synchronously over unbounded channels after every committed
//! write, and both accept queued faults so callers can rehearse every branch
//! of the failure taxonomy.
//!
//! The hub hands out one `MemoryEphemeralConnection` per client. Dropping a
//! connection through the hub (`drop_connection`) plays the role of the
//! server noticing a dead transport: it runs that connection's disconnect
//! hooks, then forgets them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    DisconnectAction, EphemeralKey, EphemeralStore, NamespaceSnapshot, NamespaceStream, RemoteEntityStore,
    RemoteError, SnapshotStream,
};
use crate::helpers::now_ms;
use crate::shape::{Shape, ShapeId, ShapePatch};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// ENTITY STORE
// =============================================================================

/// Entity store operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityOp {
    Put,
    Patch,
    Remove,
}

/// A committed write, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Put(ShapeId),
    Patch(ShapeId, ShapePatch),
    Remove(ShapeId),
}

#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    inner: Arc<Mutex<EntityInner>>,
}

#[derive(Default)]
struct EntityInner {
    docs: HashMap<ShapeId, Shape>,
    subscribers: Vec<mpsc::UnboundedSender<Result<Vec<Shape>, RemoteError>>>,
    faults: HashMap<EntityOp, VecDeque<RemoteError>>,
    writes: Vec<WriteRecord>,
}

impl EntityInner {
    fn take_fault(&mut self, op: EntityOp) -> Option<RemoteError> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn snapshot(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.docs.values().cloned().collect();
        shapes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        shapes
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }
}

impl MemoryEntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `error`. Faults queue per operation.
    pub fn fail_next(&self, op: EntityOp, error: RemoteError) {
        locked(&self.inner)
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Push `error` to every live subscription and drop them.
    pub fn fail_subscriptions(&self, error: RemoteError) {
        let mut inner = locked(&self.inner);
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Write a document as another session would, notifying subscribers.
    pub fn insert_remote(&self, shape: Shape) {
        let mut inner = locked(&self.inner);
        inner.docs.insert(shape.id, shape);
        inner.notify();
    }

    /// Delete a document as another session would, notifying subscribers.
    pub fn delete_remote(&self, id: ShapeId) {
        let mut inner = locked(&self.inner);
        if inner.docs.remove(&id).is_some() {
            inner.notify();
        }
    }

    /// Drop a document without notifying anyone.
    pub fn forget(&self, id: ShapeId) {
        locked(&self.inner).docs.remove(&id);
    }

    #[must_use]
    pub fn get(&self, id: ShapeId) -> Option<Shape> {
        locked(&self.inner).docs.get(&id).cloned()
    }

    #[must_use]
    pub fn documents(&self) -> Vec<Shape> {
        locked(&self.inner).snapshot()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        locked(&self.inner).writes.clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = locked(&self.inner);
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl RemoteEntityStore for MemoryEntityStore {
    async fn put(&self, shape: &Shape) -> Result<(), RemoteError> {
        let mut inner = locked(&self.inner);
        if let Some(err) = inner.take_fault(EntityOp::Put) {
            return Err(err);
        }
        inner.docs.insert(shape.id, shape.clone());
        inner.writes.push(WriteRecord::Put(shape.id));
        inner.notify();
        Ok(())
    }

    async fn patch(&self, id: ShapeId, patch: &ShapePatch) -> Result<(), RemoteError> {
        let mut inner = locked(&self.inner);
        if let Some(err) = inner.take_fault(EntityOp::Patch) {
            return Err(err);
        }
        let doc = inner
            .docs
            .get_mut(&id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        patch
            .apply(doc)
            .map_err(|e| RemoteError::Other(e.to_string()))?;
        inner.writes.push(WriteRecord::Patch(id, patch.clone()));
        inner.notify();
        Ok(())
    }

    async fn remove(&self, id: ShapeId) -> Result<(), RemoteError> {
        let mut inner = locked(&self.inner);
        if let Some(err) = inner.take_fault(EntityOp::Remove) {
            return Err(err);
        }
        if inner.docs.remove(&id).is_none() {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        inner.writes.push(WriteRecord::Remove(id));
        inner.notify();
        Ok(())
    }

    fn subscribe(&self) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = locked(&self.inner);
        if tx.send(Ok(inner.snapshot())).is_ok() {
            inner.subscribers.push(tx);
        }
        rx
    }
}

// =============================================================================
// EPHEMERAL HUB
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryEphemeralHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    namespaces: HashMap<String, NamespaceSnapshot>,
    subscribers: Vec<(String, mpsc::UnboundedSender<Result<NamespaceSnapshot, RemoteError>>)>,
    hooks: HashMap<Uuid, HashMap<EphemeralKey, DisconnectAction>>,
    faults: VecDeque<RemoteError>,
}

impl HubInner {
    fn notify(&mut self, namespace: &str) {
        let snapshot = self.namespaces.get(namespace).cloned().unwrap_or_default();
        self.subscribers
            .retain(|(ns, tx)| ns != namespace || tx.send(Ok(snapshot.clone())).is_ok());
    }

    fn write(&mut self, key: &EphemeralKey, value: Value) {
        self.namespaces
            .entry(key.namespace.clone())
            .or_default()
            .insert(key.key.clone(), value);
        self.notify(&key.namespace);
    }

    fn delete(&mut self, key: &EphemeralKey) {
        let removed = self
            .namespaces
            .get_mut(&key.namespace)
            .and_then(|records| records.remove(&key.key))
            .is_some();
        if removed {
            self.notify(&key.namespace);
        }
    }
}

impl MemoryEphemeralHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection.
    #[must_use]
    pub fn connect(&self) -> MemoryEphemeralConnection {
        let id = Uuid::new_v4();
        locked(&self.inner).hooks.insert(id, HashMap::new());
        MemoryEphemeralConnection { id, hub: self.clone() }
    }

    /// Simulate the server detecting that `connection` went away: run its
    /// disconnect hooks and forget them. Returns how many hooks ran.
    pub fn drop_connection(&self, connection: Uuid) -> usize {
        let mut inner = locked(&self.inner);
        let Some(actions) = inner.hooks.remove(&connection) else {
            return 0;
        };
        let count = actions.len();
        for action in actions.into_values() {
            match action {
                DisconnectAction::Remove(key) => inner.delete(&key),
                DisconnectAction::Write { key, mut value, stamp_field } => {
                    if let (Some(field), Some(obj)) = (stamp_field, value.as_object_mut()) {
                        obj.insert(field.to_owned(), Value::from(now_ms()));
                    }
                    inner.write(&key, value);
                }
            }
        }
        debug!(%connection, hooks = count, "ephemeral: connection dropped");
        count
    }

    /// Fail the next `set` or `remove` from any connection.
    pub fn fail_next_write(&self, error: RemoteError) {
        locked(&self.inner).faults.push_back(error);
    }

    /// Push `error` to every subscriber of `namespace` and drop them.
    pub fn fail_subscriptions(&self, namespace: &str, error: RemoteError) {
        let mut inner = locked(&self.inner);
        inner.subscribers.retain(|(ns, tx)| {
            if ns == namespace {
                let _ = tx.send(Err(error.clone()));
                false
            } else {
                true
            }
        });
    }

    /// Write directly, as another client would.
    pub fn insert(&self, key: &EphemeralKey, value: Value) {
        locked(&self.inner).write(key, value);
    }

    #[must_use]
    pub fn value(&self, key: &EphemeralKey) -> Option<Value> {
        locked(&self.inner)
            .namespaces
            .get(&key.namespace)
            .and_then(|records| records.get(&key.key))
            .cloned()
    }

    #[must_use]
    pub fn namespace(&self, namespace: &str) -> NamespaceSnapshot {
        locked(&self.inner)
            .namespaces
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of disconnect hooks registered by `connection`.
    #[must_use]
    pub fn pending_hooks(&self, connection: Uuid) -> usize {
        locked(&self.inner)
            .hooks
            .get(&connection)
            .map_or(0, HashMap::len)
    }
}

/// One client's view of the hub.
#[derive(Clone)]
pub struct MemoryEphemeralConnection {
    id: Uuid,
    hub: MemoryEphemeralHub,
}

impl MemoryEphemeralConnection {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drop this connection as a crashed client would.
    pub fn disconnect(&self) -> usize {
        self.hub.drop_connection(self.id)
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralConnection {
    async fn set(&self, key: &EphemeralKey, value: Value) -> Result<(), RemoteError> {
        let mut inner = locked(&self.hub.inner);
        if !inner.hooks.contains_key(&self.id) {
            return Err(RemoteError::Unavailable("connection closed".into()));
        }
        if let Some(err) = inner.faults.pop_front() {
            return Err(err);
        }
        inner.write(key, value);
        Ok(())
    }

    async fn remove(&self, key: &EphemeralKey) -> Result<(), RemoteError> {
        let mut inner = locked(&self.hub.inner);
        if !inner.hooks.contains_key(&self.id) {
            return Err(RemoteError::Unavailable("connection closed".into()));
        }
        if let Some(err) = inner.faults.pop_front() {
            return Err(err);
        }
        inner.delete(key);
        Ok(())
    }

    fn subscribe(&self, namespace: &str) -> NamespaceStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = locked(&self.hub.inner);
        let current = inner.namespaces.get(namespace).cloned().unwrap_or_default();
        if tx.send(Ok(current)).is_ok() {
            inner.subscribers.push((namespace.to_owned(), tx));
        }
        rx
    }

    async fn on_disconnect(&self, action: DisconnectAction) -> Result<(), RemoteError> {
        let mut inner = locked(&self.hub.inner);
        let Some(hooks) = inner.hooks.get_mut(&self.id) else {
            return Err(RemoteError::Unavailable("connection closed".into()));
        };
        hooks.insert(action.key().clone(), action);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
