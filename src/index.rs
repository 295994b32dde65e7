//! Immutable index snapshots.
//!
//! An [`IndexRoot`] is a point-in-time snapshot of the whole virtual-file
//! forest: every native root plus everything discovered inside its
//! containers. Snapshots are never mutated; [`IndexRoot::integrate`] merges
//! a previous snapshot with freshly analyzed files and returns a new one.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::hashing::ContentHash;
use crate::vfile::{FullPath, VirtualFile};

/// Snapshot of the indexed forest, with lookup by native path, by content
/// hash, and by full path-through-containers.
pub struct IndexRoot {
    roots: BTreeMap<std::path::PathBuf, Arc<VirtualFile>>,
    by_hash: HashMap<ContentHash, Vec<Arc<VirtualFile>>>,
}

impl IndexRoot {
    pub fn empty() -> IndexRoot {
        IndexRoot {
            roots: BTreeMap::new(),
            by_hash: HashMap::new(),
        }
    }

    /// Pure merge: previous entries whose (path, size, mtime) identity
    /// matches a fresh file are carried over unchanged, preserving their
    /// cached hash and discovered children; every other fresh file replaces
    /// any prior entry with the same native path. Inputs are not mutated.
    pub fn integrate(&self, fresh: Vec<Arc<VirtualFile>>) -> IndexRoot {
        let mut roots = self.roots.clone();
        for file in fresh {
            debug_assert!(file.is_native(), "only native files can be index roots");
            let path = file.name().as_path().to_path_buf();
            let carried = roots.get(&path).filter(|prev| {
                prev.size() == file.size() && prev.last_modified() == file.last_modified()
            });
            if carried.is_none() {
                roots.insert(path, file);
            }
        }
        IndexRoot::from_roots(roots)
    }

    /// Snapshot containing only the native roots `pred` accepts. Used to
    /// drop entries for files that no longer exist on disk.
    pub fn retain_roots(&self, mut pred: impl FnMut(&Path) -> bool) -> IndexRoot {
        let roots: BTreeMap<_, _> = self
            .roots
            .iter()
            .filter(|(path, _)| pred(path))
            .map(|(path, file)| (path.clone(), Arc::clone(file)))
            .collect();
        IndexRoot::from_roots(roots)
    }

    fn from_roots(roots: BTreeMap<std::path::PathBuf, Arc<VirtualFile>>) -> IndexRoot {
        let mut by_hash: HashMap<ContentHash, Vec<Arc<VirtualFile>>> = HashMap::new();
        for root in roots.values() {
            for node in root.walk() {
                by_hash.entry(node.hash()).or_default().push(node);
            }
        }
        IndexRoot { roots, by_hash }
    }

    /// The native root indexed under `path`, if any.
    pub fn native(&self, path: &Path) -> Option<&Arc<VirtualFile>> {
        self.roots.get(path)
    }

    /// Every node (at any nesting depth) whose bytes hash to `hash`.
    pub fn by_hash(&self, hash: ContentHash) -> &[Arc<VirtualFile>] {
        self.by_hash.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Structural lookup by full path-through-containers.
    pub fn file_for_path(&self, path: &FullPath) -> Option<Arc<VirtualFile>> {
        let mut current = Arc::clone(self.roots.get(&path.base)?);
        for segment in &path.segments {
            current = Arc::clone(current.child(segment)?);
        }
        Some(current)
    }

    /// All native roots.
    pub fn roots(&self) -> impl Iterator<Item = &Arc<VirtualFile>> {
        self.roots.values()
    }

    /// Every node in the snapshot, natives and nested alike.
    pub fn iter(&self) -> impl Iterator<Item = Arc<VirtualFile>> + '_ {
        self.roots.values().flat_map(|r| r.walk())
    }

    /// Number of nodes in the snapshot.
    pub fn len(&self) -> usize {
        self.by_hash.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfile::{AnalyzedContents, AnalyzedFile, FileName};
    use std::path::PathBuf;

    fn native(path: &str, bytes: &[u8], mtime: u64, children: Vec<AnalyzedFile>) -> Arc<VirtualFile> {
        let contents = if children.is_empty() {
            AnalyzedContents::Opaque
        } else {
            AnalyzedContents::Populated(children)
        };
        VirtualFile::freeze(AnalyzedFile {
            name: FileName::Native(PathBuf::from(path)),
            hash: ContentHash::of_bytes(bytes),
            size: bytes.len() as u64,
            last_modified: Some(mtime),
            contents,
        })
    }

    fn nested(name: &str, bytes: &[u8]) -> AnalyzedFile {
        AnalyzedFile {
            name: FileName::Nested(PathBuf::from(name)),
            hash: ContentHash::of_bytes(bytes),
            size: bytes.len() as u64,
            last_modified: None,
            contents: AnalyzedContents::Opaque,
        }
    }

    #[test]
    fn integrate_inserts_and_indexes_nested_nodes() {
        let root = IndexRoot::empty().integrate(vec![native(
            "/r/a.zip",
            b"archive-a",
            1,
            vec![nested("x.txt", b"x"), nested("y.txt", b"y")],
        )]);

        assert_eq!(root.len(), 3);
        assert!(root.native(Path::new("/r/a.zip")).is_some());
        assert_eq!(root.by_hash(ContentHash::of_bytes(b"x")).len(), 1);

        let fp = FullPath::native("/r/a.zip").join("y.txt");
        let node = root.file_for_path(&fp).unwrap();
        assert_eq!(node.hash(), ContentHash::of_bytes(b"y"));
    }

    #[test]
    fn integrate_is_idempotent() {
        let make = || native("/r/a.zip", b"archive-a", 1, vec![nested("x.txt", b"x")]);

        let once = IndexRoot::empty().integrate(vec![make()]);
        let twice = once.integrate(vec![make()]);

        assert_eq!(once.len(), twice.len());
        let fp = FullPath::native("/r/a.zip").join("x.txt");
        assert_eq!(
            once.file_for_path(&fp).unwrap().hash(),
            twice.file_for_path(&fp).unwrap().hash()
        );
        // Identity matched, so the node was carried over, not rebuilt.
        assert!(Arc::ptr_eq(
            once.native(Path::new("/r/a.zip")).unwrap(),
            twice.native(Path::new("/r/a.zip")).unwrap()
        ));
    }

    #[test]
    fn integrate_replaces_changed_identity() {
        let old = native("/r/a.zip", b"old-bytes", 1, vec![nested("x.txt", b"x")]);
        let root = IndexRoot::empty().integrate(vec![old]);

        // Same path, new mtime: the fresh node wins and prior children go.
        let new = native("/r/a.zip", b"new-bytes!", 2, vec![]);
        let merged = root.integrate(vec![new]);

        let entry = merged.native(Path::new("/r/a.zip")).unwrap();
        assert_eq!(entry.hash(), ContentHash::of_bytes(b"new-bytes!"));
        assert!(entry.children().is_empty());
        assert!(merged.by_hash(ContentHash::of_bytes(b"x")).is_empty());
    }

    #[test]
    fn integrate_never_removes_unrelated_entries() {
        let root = IndexRoot::empty()
            .integrate(vec![native("/r/a.bin", b"aaaa", 1, vec![])])
            .integrate(vec![native("/r/b.bin", b"bbbb", 1, vec![])]);
        assert!(root.native(Path::new("/r/a.bin")).is_some());
        assert!(root.native(Path::new("/r/b.bin")).is_some());
    }

    #[test]
    fn retain_roots_drops_rejected_paths() {
        let root = IndexRoot::empty()
            .integrate(vec![native("/r/keep.bin", b"k", 1, vec![])])
            .integrate(vec![native("/r/drop.bin", b"d", 1, vec![])]);
        let kept = root.retain_roots(|p| p.ends_with("keep.bin"));
        assert!(kept.native(Path::new("/r/keep.bin")).is_some());
        assert!(kept.native(Path::new("/r/drop.bin")).is_none());
        // Original snapshot is untouched.
        assert!(root.native(Path::new("/r/drop.bin")).is_some());
    }
}
