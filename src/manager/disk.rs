//! On-disk state manager: one framed blob per token.

use crate::error::{Result, SyncError};
use crate::manager::{LeaseRelease, LeaseTable, LockTiming, StateLease, StateManager};
use crate::minify::Schema;
use crate::state::StateTree;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Magic bytes for state blob files.
const STATE_MAGIC: &[u8; 4] = b"SST\0";

/// Current state blob format version.
const STATE_VERSION: u8 = 1;

/// File extension of state blobs.
const STATE_EXT: &str = "state";

/// magic + version + payload length
const HEADER_LEN: usize = 4 + 1 + 8;

/// Trees persisted under a directory owned by this process.
///
/// The directory is guarded by an exclusive `LOCK` file, so only one process
/// can serve it. Blob writes go to a temporary file that is renamed into
/// place.
pub struct DiskStateManager {
    schema: Arc<Schema>,
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Recently used payloads by token.
    cache: Mutex<LruCache<String, Vec<u8>>>,

    leases: LeaseTable,
}

impl DiskStateManager {
    /// Open (creating if needed) the state directory at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        schema: Arc<Schema>,
        timing: LockTiming,
        cache_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let lock_file = Self::acquire_lock(&path)?;
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        tracing::debug!(path = %path.display(), "opened state directory");
        Ok(Self {
            schema,
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
            leases: LeaseTable::new(timing.timeout),
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blob file for a token. Tokens are hashed so any string is a safe name.
    fn blob_path(&self, token: &str) -> PathBuf {
        let digest = Sha256::digest(token.as_bytes());
        self.path.join(format!("{}.{STATE_EXT}", hex::encode(digest)))
    }

    fn load(&self, token: &str) -> Result<Option<StateTree>> {
        if let Some(payload) = self.cache.lock().get(token).cloned() {
            return StateTree::from_bytes(Arc::clone(&self.schema), &payload).map(Some);
        }

        let blob_path = self.blob_path(token);
        let bytes = match fs::read(&blob_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload = decode_frame(&bytes)?.to_vec();
        let tree = StateTree::from_bytes(Arc::clone(&self.schema), &payload)?;
        self.cache.lock().put(token.to_string(), payload);
        Ok(Some(tree))
    }

    fn store(&self, token: &str, tree: &StateTree) -> Result<()> {
        let payload = tree.to_bytes()?;
        let blob_path = self.blob_path(token);
        let tmp_path = blob_path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&encode_frame(&payload))?;
        file.sync_all()?;
        fs::rename(&tmp_path, &blob_path)?;

        self.cache.lock().put(token.to_string(), payload);
        Ok(())
    }

    /// Delete blobs not written for longer than `max_age`. Returns how many
    /// were removed.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXT) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            // Cache keys are tokens, not file names; start over.
            self.cache.lock().clear();
            tracing::debug!(removed, "purged expired state blobs");
        }
        Ok(removed)
    }
}

impl StateManager for DiskStateManager {
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
        self.leases.acquire(token)?;
        let tree = match self.load(token) {
            Ok(tree) => tree.unwrap_or_else(|| StateTree::new(Arc::clone(&self.schema))),
            Err(e) => {
                self.leases.release(token);
                return Err(e);
            }
        };
        Ok(StateLease::new(token, tree, Box::new(DiskRelease { manager: self })))
    }

    fn set(&self, token: &str, tree: StateTree) -> Result<()> {
        self.store(token, &tree)
    }
}

struct DiskRelease<'a> {
    manager: &'a DiskStateManager,
}

impl LeaseRelease for DiskRelease<'_> {
    fn commit(self: Box<Self>, token: &str, tree: StateTree) -> Result<()> {
        let result = self.manager.store(token, &tree);
        self.manager.leases.release(token);
        result
    }

    fn abort(self: Box<Self>, token: &str) {
        self.manager.leases.release(token);
    }
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    out.extend_from_slice(STATE_MAGIC);
    out.push(STATE_VERSION);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out
}

fn decode_frame(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(SyncError::Corruption("state blob truncated".into()));
    }
    if &bytes[..4] != STATE_MAGIC {
        return Err(SyncError::InvalidFormat("Invalid state blob magic".into()));
    }
    if bytes[4] != STATE_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported state blob version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if len.checked_add(HEADER_LEN + 4) != Some(bytes.len()) {
        return Err(SyncError::Corruption(format!(
            "state blob length mismatch: header says {len} bytes"
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(SyncError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateRegistry, StateType};
    use crate::value::Value;
    use tempfile::TempDir;

    fn schema() -> Arc<Schema> {
        let registry = StateRegistry::new(
            StateType::new("state")
                .field("items", Value::list([]))
                .field("count", 0),
        )
        .unwrap();
        Arc::new(Schema::plain(Arc::new(registry)))
    }

    fn open(dir: &TempDir) -> DiskStateManager {
        DiskStateManager::open(dir.path(), schema(), LockTiming::default(), 4).unwrap()
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let manager = open(&dir);
            let lease = manager.modify("client-1").unwrap();
            lease.tree().root().set("count", 7).unwrap();
            lease.commit().unwrap();
        }

        let manager = open(&dir);
        let tree = manager.get("client-1").unwrap();
        assert_eq!(tree.root().get("count").unwrap().as_int(), Some(7));
        assert!(!tree.is_writable());
    }

    #[test]
    fn test_directory_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let _manager = open(&dir);
        let second = DiskStateManager::open(dir.path(), schema(), LockTiming::default(), 4);
        assert!(matches!(second, Err(SyncError::Locked)));
    }

    #[test]
    fn test_aborted_lease_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let lease = manager.modify("t").unwrap();
        lease.tree().root().set("count", 1).unwrap();
        lease.abort();

        assert!(!manager.blob_path("t").exists());
        assert_eq!(manager.get("t").unwrap().root().get("count").unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_corrupted_blob_detected() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        manager.set("t", StateTree::new(schema())).unwrap();

        let path = manager.blob_path("t");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        manager.cache.lock().clear();

        let err = manager.get("t").unwrap_err();
        assert!(matches!(err, SyncError::ChecksumMismatch { .. }));
        // A failed load must not keep the lease.
        assert!(manager.modify("t").is_err());
        assert!(!manager.leases.is_held("t"));
    }

    #[test]
    fn test_frame_rejects_bad_magic() {
        let mut frame = encode_frame(b"payload");
        assert_eq!(decode_frame(&frame).unwrap(), b"payload");
        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(SyncError::InvalidFormat(_))));
        assert!(matches!(decode_frame(&frame[..6]), Err(SyncError::Corruption(_))));
    }

    #[test]
    fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        manager.set("t", StateTree::new(schema())).unwrap();
        assert_eq!(manager.purge_expired(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(manager.purge_expired(Duration::ZERO).unwrap(), 1);
        assert!(!manager.blob_path("t").exists());
    }
}
