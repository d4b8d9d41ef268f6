//! Per-token state storage with exclusive write leases.
//!
//! Three backends share one contract:
//! - [`MemoryStateManager`]: in-process map, single process
//! - [`DiskStateManager`]: one framed blob per token, crash-persistent
//! - [`CacheStateManager`]: shared cache with a TTL lock key, multi-process

pub mod cache;
pub mod disk;
pub mod memory;

pub use cache::{CacheClient, CacheStateManager, MemoryCache};
pub use disk::DiskStateManager;
pub use memory::MemoryStateManager;

use crate::error::{Result, SyncError};
use crate::minify::Schema;
use crate::state::StateTree;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which backend an app stores its trees in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateManagerMode {
    #[default]
    Memory,
    Disk,
    Cache,
}

/// Lease timing shared by all backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTiming {
    /// How long a cache lease stays valid once taken.
    pub expiration: Duration,
    /// How long `modify` waits for a held lease before giving up.
    pub timeout: Duration,
    /// Delay between acquisition attempts on the cache backend.
    pub poll_interval: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            expiration: Duration::from_millis(10_000),
            timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Storage of one state tree per client token.
pub trait StateManager: Send + Sync {
    fn schema(&self) -> &Arc<Schema>;

    /// Isolated read-only copy of the token's tree. Unknown tokens get a
    /// tree with default values.
    fn get(&self, token: &str) -> Result<StateTree>;

    /// Exclusive access to the token's tree.
    ///
    /// Blocks while another lease is held, failing with
    /// [`SyncError::LockExpired`] once the lock timeout passes.
    fn modify(&self, token: &str) -> Result<StateLease<'_>>;

    /// Replace the stored tree without taking a lease.
    fn set(&self, token: &str, tree: StateTree) -> Result<()>;
}

/// Backend half of a lease: persists or discards when the lease ends.
pub trait LeaseRelease {
    fn commit(self: Box<Self>, token: &str, tree: StateTree) -> Result<()>;
    fn abort(self: Box<Self>, token: &str);
}

/// Exclusive handle on one token's live tree.
///
/// [`StateLease::commit`] persists the tree and releases the lease. Dropping
/// the lease without committing discards every change.
pub struct StateLease<'a> {
    token: String,
    tree: StateTree,
    release: Option<Box<dyn LeaseRelease + 'a>>,
}

impl<'a> StateLease<'a> {
    pub fn new(token: impl Into<String>, tree: StateTree, release: Box<dyn LeaseRelease + 'a>) -> Self {
        Self {
            token: token.into(),
            tree,
            release: Some(release),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The live tree. Handles cloned from it stop accepting writes once the
    /// lease ends.
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn commit(mut self) -> Result<()> {
        let release = self.release.take();
        let tree = self.tree.clone();
        tree.set_writable(false);
        match release {
            Some(release) => release.commit(&self.token, tree),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) {
        self.finish_aborted();
    }

    fn finish_aborted(&mut self) {
        if let Some(release) = self.release.take() {
            self.tree.set_writable(false);
            tracing::debug!(token = %self.token, "lease released without commit");
            release.abort(&self.token);
        }
    }
}

impl Drop for StateLease<'_> {
    fn drop(&mut self) {
        self.finish_aborted();
    }
}

impl fmt::Debug for StateLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLease")
            .field("token", &self.token)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// In-process lease bookkeeping for the memory and disk backends.
pub(crate) struct LeaseTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    timeout: Duration,
}

impl LeaseTable {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Wait until `token` is free and take it.
    pub(crate) fn acquire(&self, token: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut held = self.held.lock();
        while held.contains(token) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(token) {
                tracing::warn!(%token, timeout = ?self.timeout, "lease acquisition timed out");
                return Err(SyncError::lock_expired(
                    token,
                    format!("could not acquire lease within {:?}", self.timeout),
                ));
            }
        }
        held.insert(token.to_string());
        Ok(())
    }

    pub(crate) fn release(&self, token: &str) {
        self.held.lock().remove(token);
        self.released.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, token: &str) -> bool {
        self.held.lock().contains(token)
    }
}
