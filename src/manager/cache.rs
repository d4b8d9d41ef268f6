//! Shared-cache state manager for multi-process deployments.
//!
//! The tree blob lives under the token key. The lease is a separate
//! `"{token}_lock"` key holding a random lease id with a TTL, so a crashed
//! holder can never block a token for longer than the lock expiration.

use crate::error::{Result, SyncError};
use crate::manager::{LeaseRelease, LockTiming, StateLease, StateManager};
use crate::minify::Schema;
use crate::state::StateTree;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Minimal key-value surface the cache backend needs.
///
/// Implementations must make `set_if_absent` atomic; everything else may be
/// a plain round-trip.
pub trait CacheClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Set only when the key is missing or expired. Returns whether the
    /// value was written.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete only when the key still holds `expected`.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;
}

/// In-process [`CacheClient`] with per-key expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) key count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheClient for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_vec(), now + ttl));
        Ok(true)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .is_some_and(|(value, expires)| value == expected && *expires > Instant::now());
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

/// Trees stored in a shared cache, leased through a lock key.
pub struct CacheStateManager {
    schema: Arc<Schema>,
    client: Arc<dyn CacheClient>,
    timing: LockTiming,
    token_expiration: Duration,
}

impl CacheStateManager {
    pub fn new(
        schema: Arc<Schema>,
        client: Arc<dyn CacheClient>,
        timing: LockTiming,
        token_expiration: Duration,
    ) -> Self {
        Self {
            schema,
            client,
            timing,
            token_expiration,
        }
    }

    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.client
    }

    fn lock_key(token: &str) -> String {
        format!("{token}_lock")
    }

    fn load(&self, token: &str) -> Result<Option<StateTree>> {
        match self.client.get(token)? {
            Some(bytes) => StateTree::from_bytes(Arc::clone(&self.schema), &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Poll the lock key until we own it or the lock timeout passes.
    fn acquire(&self, token: &str, lease_id: &str) -> Result<()> {
        let lock_key = Self::lock_key(token);
        let deadline = Instant::now() + self.timing.timeout;
        loop {
            if self
                .client
                .set_if_absent(&lock_key, lease_id.as_bytes(), self.timing.expiration)?
            {
                tracing::debug!(%token, %lease_id, "lease acquired");
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(%token, timeout = ?self.timing.timeout, "lease acquisition timed out");
                return Err(SyncError::lock_expired(
                    token,
                    format!("could not acquire lease within {:?}", self.timing.timeout),
                ));
            }
            thread::sleep(self.timing.poll_interval);
        }
    }

    fn release(&self, token: &str, lease_id: &str) -> Result<bool> {
        self.client
            .delete_if_equals(&Self::lock_key(token), lease_id.as_bytes())
    }
}

impl StateManager for CacheStateManager {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn get(&self, token: &str) -> Result<StateTree> {
        let tree = self
            .load(token)?
            .unwrap_or_else(|| StateTree::new(Arc::clone(&self.schema)));
        tree.set_writable(false);
        Ok(tree)
    }

    fn modify(&self, token: &str) -> Result<StateLease<'_>> {
        let lease_id = Uuid::new_v4().to_string();
        self.acquire(token, &lease_id)?;
        let tree = match self.load(token) {
            Ok(tree) => tree.unwrap_or_else(|| StateTree::new(Arc::clone(&self.schema))),
            Err(e) => {
                let _ = self.release(token, &lease_id);
                return Err(e);
            }
        };
        Ok(StateLease::new(
            token,
            tree,
            Box::new(CacheRelease {
                manager: self,
                lease_id,
            }),
        ))
    }

    fn set(&self, token: &str, tree: StateTree) -> Result<()> {
        self.client
            .set(token, &tree.to_bytes()?, self.token_expiration)
    }
}

struct CacheRelease<'a> {
    manager: &'a CacheStateManager,
    lease_id: String,
}

impl LeaseRelease for CacheRelease<'_> {
    fn commit(self: Box<Self>, token: &str, tree: StateTree) -> Result<()> {
        let manager = self.manager;
        let lock_key = CacheStateManager::lock_key(token);
        let holder = manager.client.get(&lock_key)?;
        if holder.as_deref() != Some(self.lease_id.as_bytes()) {
            tracing::warn!(%token, lease_id = %self.lease_id, "lease expired before commit");
            return Err(SyncError::lock_expired(token, "lease expired before commit"));
        }
        manager
            .client
            .set(token, &tree.to_bytes()?, manager.token_expiration)?;
        manager.release(token, &self.lease_id)?;
        Ok(())
    }

    fn abort(self: Box<Self>, token: &str) {
        if let Err(e) = self.manager.release(token, &self.lease_id) {
            tracing::warn!(%token, error = %e, "failed to release lease");
        }
    }
}
