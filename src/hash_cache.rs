//! Persistent hash cache for native files.
//!
//! Hashing a large file is the single most expensive step of indexing, so
//! results are memoized by path identity: a cached entry is valid as long as
//! the file's size and modification time are unchanged. Any change in either
//! invalidates the entry; a stale hash is never returned.
//!
//! On disk the cache is a magic-tagged, versioned JSON payload written with
//! an atomic temp-file-and-rename, in the same framing style as the
//! known-file store.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::VfsError;
use crate::hashing::{self, ContentHash};

pub const HASH_CACHE_MAGIC: &[u8; 8] = b"AVFSHSH\0";
pub const HASH_CACHE_VERSION: u32 = 1;

/// One persisted record: valid while size and mtime match the file on disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachedHash {
    pub size: u64,
    pub mtime_millis: u64,
    pub hash: ContentHash,
}

/// Memoized (path → hash) mapping with persistence.
pub struct HashCache {
    path: PathBuf,
    entries: RwLock<HashMap<PathBuf, CachedHash>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HashCache {
    /// Open the cache backed by `path`, loading any valid persisted state.
    /// A missing, malformed, or version-mismatched file means a cold cache.
    pub fn open(path: impl Into<PathBuf>) -> HashCache {
        let path = path.into();
        let entries = match load_tagged_json::<HashMap<PathBuf, CachedHash>>(
            &path,
            HASH_CACHE_MAGIC,
            HASH_CACHE_VERSION,
        ) {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(err) => {
                warn!(cache = %path.display(), %err, "discarding hash cache");
                HashMap::new()
            }
        };
        HashCache {
            path,
            entries: RwLock::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the content hash of `file`, reusing the persisted value when
    /// the file's size and modification time are unchanged. On a miss the
    /// file is streamed through blake3 and the entry updated.
    pub async fn get_or_compute(&self, file: &Path) -> Result<(ContentHash, u64, u64), VfsError> {
        let meta = tokio::fs::metadata(file)
            .await
            .map_err(|e| VfsError::io(e, file))?;
        let size = meta.len();
        let mtime = mtime_millis(&meta).map_err(|e| VfsError::io(e, file))?;

        if let Some(entry) = self.entries.read().get(file) {
            if entry.size == size && entry.mtime_millis == mtime {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((entry.hash, size, mtime));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(file = %file.display(), size, "hashing file");
        let (hash, _) = hashing::hash_file(file).await?;
        self.entries.write().insert(
            file.to_path_buf(),
            CachedHash {
                size,
                mtime_millis: mtime,
                hash,
            },
        );
        Ok((hash, size, mtime))
    }

    /// Drop entries whose path no longer exists on disk.
    pub fn clean(&self) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|path, _| path.exists());
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, "pruned dead hash-cache entries");
        }
    }

    /// Persist the cache atomically.
    pub fn save(&self) -> Result<(), VfsError> {
        let snapshot = self.entries.read().clone();
        save_tagged_json(&self.path, HASH_CACHE_MAGIC, HASH_CACHE_VERSION, &snapshot)
    }

    /// (cache hits, cache misses) since open. Misses are full re-hashes.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Modification time as unix millis.
pub fn mtime_millis(meta: &std::fs::Metadata) -> std::io::Result<u64> {
    let mtime = meta.modified()?;
    let since = mtime
        .duration_since(UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(since.as_millis() as u64)
}

/// Read a magic-tagged, versioned JSON payload. `Ok(None)` means the file
/// does not exist; a magic or version mismatch is an error so callers treat
/// the cache as absent rather than interpreting foreign data.
pub(crate) fn load_tagged_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
) -> Result<Option<T>, VfsError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VfsError::io(e, path)),
    };
    if bytes.len() < 12 || &bytes[..8] != magic {
        return Err(VfsError::CacheFormat {
            path: path.to_path_buf(),
            reason: "magic bytes mismatch".into(),
        });
    }
    let found = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if found != version {
        return Err(VfsError::CacheFormat {
            path: path.to_path_buf(),
            reason: format!("version {found}, expected {version}"),
        });
    }
    Ok(Some(serde_json::from_slice(&bytes[12..])?))
}

/// Write `magic + version + JSON` through a temp file and rename into place.
pub(crate) fn save_tagged_json<T: Serialize>(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
    value: &T,
) -> Result<(), VfsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| VfsError::io(e, parent))?;
        }
    }
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(d) => tempfile::NamedTempFile::new_in(d),
        None => tempfile::NamedTempFile::new(),
    }
    .map_err(|e| VfsError::io(e, path))?;
    tmp.write_all(magic).map_err(|e| VfsError::io(e, path))?;
    tmp.write_all(&version.to_le_bytes())
        .map_err(|e| VfsError::io(e, path))?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush().map_err(|e| VfsError::io(e, path))?;
    tmp.persist(path)
        .map_err(|e| VfsError::io(e.error, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(path: &Path, bytes: &[u8]) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_file(&target, b"some bytes worth hashing");
        let cache = HashCache::open(dir.path().join("hashes.avfs"));

        let (h1, size, _) = cache.get_or_compute(&target).await.unwrap();
        let (h2, _, _) = cache.get_or_compute(&target).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(size, 24);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[tokio::test]
    async fn size_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_file(&target, b"v1");
        let cache = HashCache::open(dir.path().join("hashes.avfs"));

        let (h1, _, _) = cache.get_or_compute(&target).await.unwrap();
        write_file(&target, b"v2 longer");
        let (h2, _, _) = cache.get_or_compute(&target).await.unwrap();

        assert_ne!(h1, h2);
        assert_eq!(h2, ContentHash::of_bytes(b"v2 longer"));
        assert_eq!(cache.stats().1, 2); // both were misses
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_file(&target, b"persist me");
        let cache_path = dir.path().join("hashes.avfs");

        let first = HashCache::open(&cache_path);
        let (h1, _, _) = first.get_or_compute(&target).await.unwrap();
        first.save().unwrap();

        let second = HashCache::open(&cache_path);
        let (h2, _, _) = second.get_or_compute(&target).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(second.stats(), (1, 0)); // served from the persisted entry
    }

    #[tokio::test]
    async fn clean_drops_dead_paths() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        write_file(&target, b"transient");
        let cache = HashCache::open(dir.path().join("hashes.avfs"));
        cache.get_or_compute(&target).await.unwrap();
        assert_eq!(cache.len(), 1);

        std::fs::remove_file(&target).unwrap();
        cache.clean();
        assert!(cache.is_empty());
    }

    #[test]
    fn foreign_magic_is_rejected_not_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("hashes.avfs");
        write_file(&cache_path, b"NOTMYFMT\x01\x00\x00\x00{}");

        // open() logs and falls back to cold.
        let cache = HashCache::open(&cache_path);
        assert!(cache.is_empty());

        let err = load_tagged_json::<HashMap<PathBuf, CachedHash>>(
            &cache_path,
            HASH_CACHE_MAGIC,
            HASH_CACHE_VERSION,
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::CacheFormat { .. }));
    }

    #[test]
    fn version_bump_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("hashes.avfs");
        save_tagged_json(
            &cache_path,
            HASH_CACHE_MAGIC,
            HASH_CACHE_VERSION + 1,
            &HashMap::<PathBuf, CachedHash>::new(),
        )
        .unwrap();

        let err = load_tagged_json::<HashMap<PathBuf, CachedHash>>(
            &cache_path,
            HASH_CACHE_MAGIC,
            HASH_CACHE_VERSION,
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::CacheFormat { .. }));
    }
}
