//! Known-file persistence store.
//!
//! When a container is analyzed for the first time its whole interior tree
//! is recorded here, keyed by the container's content hash. Re-indexing any
//! file with the same bytes — even under a new name or path — then
//! reconstructs the tree from the store instead of re-extracting.
//!
//! The on-disk format is a fixed magic string, a `u32` little-endian format
//! version, and a JSON payload. A mismatch on magic or version is a hard
//! failure at the parsing layer; the store starts cold rather than guessing
//! at foreign data.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::VfsError;
use crate::hash_cache::{load_tagged_json, save_tagged_json};
use crate::hashing::ContentHash;
use crate::vfile::KnownEntry;

pub const KNOWN_STORE_MAGIC: &[u8; 8] = b"AVFSKNF\0";
pub const KNOWN_STORE_VERSION: u32 = 1;

/// Persisted map from container content hash to its interior tree.
pub struct KnownFileStore {
    path: PathBuf,
    entries: RwLock<HashMap<ContentHash, KnownEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KnownFileStore {
    /// Open the store backed by `path`. Missing, malformed, or
    /// wrong-version files yield an empty store.
    pub fn open(path: impl Into<PathBuf>) -> KnownFileStore {
        let path = path.into();
        let entries = match load_tagged_json::<HashMap<ContentHash, KnownEntry>>(
            &path,
            KNOWN_STORE_MAGIC,
            KNOWN_STORE_VERSION,
        ) {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(err) => {
                warn!(store = %path.display(), %err, "discarding known-file store");
                HashMap::new()
            }
        };
        KnownFileStore {
            path,
            entries: RwLock::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Previously discovered interior tree of the container whose bytes hash
    /// to `hash`, if any.
    pub fn lookup(&self, hash: ContentHash) -> Option<KnownEntry> {
        let found = self.entries.read().get(&hash).cloned();
        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record the interior tree discovered for a container.
    pub fn record(&self, hash: ContentHash, entry: KnownEntry) {
        self.entries.write().insert(hash, entry);
    }

    /// Drop every record whose container hash is not in `referenced`.
    pub fn clean(&self, referenced: &HashSet<ContentHash>) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|hash, _| referenced.contains(hash));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, "pruned unreferenced known-file records");
        }
    }

    /// Persist the store atomically.
    pub fn save(&self) -> Result<(), VfsError> {
        let snapshot = self.entries.read().clone();
        save_tagged_json(&self.path, KNOWN_STORE_MAGIC, KNOWN_STORE_VERSION, &snapshot)
    }

    /// (lookup hits, lookup misses) since open.
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
