//! In-process state manager.

use crate::error::Result;
use crate::manager::{LeaseRelease, LeaseTable, LockTiming, StateLease, StateManager};
use crate::minify::Schema;
use crate::state::StateTree;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Trees kept in a map for the lifetime of the process.
///
/// Stored trees are never handed out directly: readers get read-only copies
/// and lease holders get writable copies that replace the stored tree on
/// commit.
pub struct MemoryStateManager {
    schema: Arc<Schema>,
    states: Mutex<HashMap<String, StateTree>>,
    leases: LeaseTable,
}

impl MemoryStateManager {
    pub fn new(schema: Arc<Schema>, timing: LockTiming) -> Self {
        Self {
            schema,
            states: Mutex::new(HashMap::new()),
            leases: LeaseTable::new(timing.timeout),
        }
    }

    /// Number of tokens with a stored tree.
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a token's tree.
    pub fn remove(&self, token: &str) -> bool {
        self.states.lock().remove(token).is_some()
    }
}

impl StateManager for MemoryStateManager {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn get(&self, token: &str) -> Result<StateTree> {
        if let Some(tree) = self.states.lock().get(token) {
            return Ok(tree.read_only_copy());
        }
        let tree = StateTree::new(Arc::clone(&self.schema));
        tree.set_writable(false);
        Ok(tree)
    }

    fn modify(&self, token: &str) -> Result<StateLease<'_>> {
        self.leases.acquire(token)?;
        let tree = match self.states.lock().get(token) {
            Some(stored) => stored.deep_copy(),
            None => StateTree::new(Arc::clone(&self.schema)),
        };
        Ok(StateLease::new(token, tree, Box::new(MemoryRelease { manager: self })))
    }

    fn set(&self, token: &str, tree: StateTree) -> Result<()> {
        self.states.lock().insert(token.to_string(), tree.read_only_copy());
        Ok(())
    }
}

struct MemoryRelease<'a> {
    manager: &'a MemoryStateManager,
}

impl LeaseRelease for MemoryRelease<'_> {
    fn commit(self: Box<Self>, token: &str, tree: StateTree) -> Result<()> {
        self.manager.states.lock().insert(token.to_string(), tree);
        self.manager.leases.release(token);
        Ok(())
    }

    fn abort(self: Box<Self>, token: &str) {
        self.manager.leases.release(token);
    }
}
