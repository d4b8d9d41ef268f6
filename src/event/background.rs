//! Context for handlers that run outside the event's lease.

use crate::delta::collect_delta;
use crate::error::Result;
use crate::event::{HandlerContext, HandlerError};
use crate::manager::StateManager;
use crate::proxy::{Arg, Item};
use crate::state::{StateNode, StateTree};
use crate::types::{EventSpec, StateUpdate, UpdateSender};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What a background handler sees.
///
/// Reads go to a read-only snapshot of the token's tree, so writing through
/// [`BackgroundContext::set`] or a proxy fails with
/// [`SyncError::ImmutableState`]. Mutations happen inside
/// [`BackgroundContext::modify`], which holds the lease only for the closure.
///
/// [`SyncError::ImmutableState`]: crate::error::SyncError::ImmutableState
pub struct BackgroundContext {
    token: String,
    /// Declared path of the node the handler belongs to.
    node_path: String,
    manager: Arc<dyn StateManager>,
    updates: UpdateSender,
    snapshot: Mutex<StateTree>,
}

impl BackgroundContext {
    pub(crate) fn new(
        token: impl Into<String>,
        node_path: impl Into<String>,
        manager: Arc<dyn StateManager>,
        updates: UpdateSender,
    ) -> Result<Self> {
        let token = token.into();
        let snapshot = manager.get(&token)?;
        Ok(Self {
            token,
            node_path: node_path.into(),
            manager,
            updates,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The handler's node in the current snapshot.
    pub fn node(&self) -> Result<Arc<StateNode>> {
        self.snapshot.lock().substate(&self.node_path)
    }

    pub fn get(&self, field: &str) -> Result<Value> {
        self.node()?.get(field)
    }

    pub fn item(&self, field: &str) -> Result<Item> {
        self.node()?.item(field)
    }

    /// Always fails: the snapshot is read-only. Use [`BackgroundContext::modify`].
    pub fn set(&self, field: &str, value: impl Into<Arg>) -> Result<()> {
        self.node()?.set(field, value)
    }

    /// Run one mutation burst under the token's lease.
    ///
    /// The changes are flushed as an update and committed before this
    /// returns; the snapshot is refreshed afterwards. An error from `burst`
    /// discards its changes.
    pub fn modify<R, F>(&self, burst: F) -> std::result::Result<R, HandlerError>
    where
        F: FnOnce(&mut HandlerContext) -> std::result::Result<R, HandlerError>,
    {
        let lease = self.manager.modify(&self.token)?;
        let tree = lease.tree().clone();
        let node = tree.substate(&self.node_path)?;
        let mut ctx = HandlerContext::new(self.token.as_str(), tree.clone(), node);

        let out = burst(&mut ctx)?;
        let delta = collect_delta(&tree)?;
        lease.commit()?;
        tracing::debug!(token = %self.token, fields = delta.len(), "background burst committed");

        if !delta.is_empty() {
            self.send(StateUpdate {
                delta,
                events: Vec::new(),
                is_final: true,
            });
        }
        *self.snapshot.lock() = self.manager.get(&self.token)?;
        Ok(out)
    }

    /// Wait without holding the lease.
    pub fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Ask the UI to dispatch `events`.
    pub fn emit(&self, events: Vec<EventSpec>) {
        if events.is_empty() {
            return;
        }
        self.send(StateUpdate {
            delta: Default::default(),
            events,
            is_final: true,
        });
    }

    fn send(&self, update: StateUpdate) {
        if self.updates.send(update).is_err() {
            tracing::debug!(token = %self.token, "update receiver dropped");
        }
    }
}
