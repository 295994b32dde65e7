//! The immutable virtual-file data model.
//!
//! A [`VirtualFile`] represents one file, either *native* (present directly
//! on a physical filesystem root) or *nested* (an entry inside a container,
//! possibly inside further containers). Nodes form a genuine tree: a
//! container owns its children top-down, while the parent edge is a
//! non-owning [`Weak`] back-reference used only for navigation.
//!
//! Nodes are immutable once published. Analysis builds a parent-free
//! [`AnalyzedFile`] tree first; [`VirtualFile::freeze`] then converts it into
//! an `Arc` tree in one pass, so no reader ever observes a half-populated
//! container.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};

use crate::hashing::ContentHash;

/// Path identity of one node: absolute for natives, relative to the
/// immediate parent for nested files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileName {
    /// Absolute path of a file on a physical filesystem root.
    Native(PathBuf),
    /// Path of an entry relative to its containing archive.
    Nested(PathBuf),
}

impl FileName {
    pub fn as_path(&self) -> &Path {
        match self {
            FileName::Native(p) | FileName::Nested(p) => p,
        }
    }
}

/// Container-analysis state of a node.
///
/// A node with no children is either a plain leaf ([`Contents::Opaque`]) or a
/// container whose interior has not been discovered yet
/// ([`Contents::Unanalyzed`]). Children appear only through `freeze`, never
/// by mutation.
#[derive(Debug)]
pub enum Contents {
    /// Not a container; the bytes have no interior entries.
    Opaque,
    /// Classified as a container, interior not yet discovered.
    Unanalyzed,
    /// Analyzed container with its ordered interior entries.
    Populated(Vec<Arc<VirtualFile>>),
}

/// One file in the index, native or nested.
pub struct VirtualFile {
    name: FileName,
    hash: ContentHash,
    size: u64,
    /// Unix millis; meaningful only for native files (cache invalidation).
    last_modified: Option<u64>,
    parent: Weak<VirtualFile>,
    contents: Contents,
    full_path: OnceLock<FullPath>,
}

impl VirtualFile {
    pub fn name(&self) -> &FileName {
        &self.name
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> Option<u64> {
        self.last_modified
    }

    /// The containing node, or `None` for a native root.
    pub fn parent(&self) -> Option<Arc<VirtualFile>> {
        self.parent.upgrade()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.name, FileName::Native(_))
    }

    /// Interior entries, empty unless this is an analyzed container.
    pub fn children(&self) -> &[Arc<VirtualFile>] {
        match &self.contents {
            Contents::Populated(children) => children,
            _ => &[],
        }
    }

    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    /// True for nodes classified as containers, analyzed or not.
    pub fn is_container(&self) -> bool {
        !matches!(self.contents, Contents::Opaque)
    }

    /// Direct child by its relative name.
    pub fn child(&self, name: &Path) -> Option<&Arc<VirtualFile>> {
        self.children().iter().find(|c| c.name.as_path() == name)
    }

    /// The native-file ancestor this node ultimately lives under.
    pub fn native_root(self: &Arc<Self>) -> Arc<VirtualFile> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Structural identity: absolute path of the native ancestor followed by
    /// the relative segments down to this node. Computed once and cached.
    pub fn full_path(self: &Arc<Self>) -> &FullPath {
        self.full_path.get_or_init(|| {
            let mut segments = Vec::new();
            let mut current = Arc::clone(self);
            while let Some(parent) = current.parent() {
                segments.push(current.name.as_path().to_path_buf());
                current = parent;
            }
            segments.reverse();
            FullPath {
                base: current.name.as_path().to_path_buf(),
                segments,
            }
        })
    }

    /// This node and every transitive descendant.
    pub fn walk(self: &Arc<Self>) -> Vec<Arc<VirtualFile>> {
        let mut out = Vec::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(node) = stack.pop() {
            for child in node.children() {
                stack.push(Arc::clone(child));
            }
            out.push(node);
        }
        out
    }

    /// Convert an analyzed tree into the published `Arc` form, wiring weak
    /// parent links with [`Arc::new_cyclic`].
    pub fn freeze(analyzed: AnalyzedFile) -> Arc<VirtualFile> {
        Self::freeze_under(analyzed, Weak::new())
    }

    fn freeze_under(analyzed: AnalyzedFile, parent: Weak<VirtualFile>) -> Arc<VirtualFile> {
        Arc::new_cyclic(|me| VirtualFile {
            name: analyzed.name,
            hash: analyzed.hash,
            size: analyzed.size,
            last_modified: analyzed.last_modified,
            parent,
            contents: match analyzed.contents {
                AnalyzedContents::Opaque => Contents::Opaque,
                AnalyzedContents::Unanalyzed => Contents::Unanalyzed,
                AnalyzedContents::Populated(children) => Contents::Populated(
                    children
                        .into_iter()
                        .map(|c| Self::freeze_under(c, me.clone()))
                        .collect(),
                ),
            },
            full_path: OnceLock::new(),
        })
    }

    /// Detached, serializable form of this subtree for the known-file store.
    pub fn to_known_entry(self: &Arc<Self>) -> KnownEntry {
        KnownEntry {
            name: self.name.as_path().to_path_buf(),
            hash: self.hash,
            size: self.size,
            container: self.is_container(),
            children: self.children().iter().map(|c| c.to_known_entry()).collect(),
        }
    }
}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("children", &self.children().len())
            .finish()
    }
}

/// Parent-free analysis result, the input to [`VirtualFile::freeze`].
#[derive(Debug)]
pub struct AnalyzedFile {
    pub name: FileName,
    pub hash: ContentHash,
    pub size: u64,
    pub last_modified: Option<u64>,
    pub contents: AnalyzedContents,
}

#[derive(Debug)]
pub enum AnalyzedContents {
    Opaque,
    Unanalyzed,
    Populated(Vec<AnalyzedFile>),
}

impl AnalyzedFile {
    /// Rebuild an analysis tree from a stored [`KnownEntry`], used when the
    /// known-file store already recorded a container's interior.
    pub fn from_known_entry(entry: &KnownEntry, native: Option<(PathBuf, u64, Option<u64>)>) -> AnalyzedFile {
        let (name, size, last_modified) = match native {
            // Top node: identity comes from the file on disk, interior from
            // the store.
            Some((path, size, mtime)) => (FileName::Native(path), size, mtime),
            None => (FileName::Nested(entry.name.clone()), entry.size, None),
        };
        let contents = if entry.children.is_empty() {
            if entry.container {
                AnalyzedContents::Unanalyzed
            } else {
                AnalyzedContents::Opaque
            }
        } else {
            AnalyzedContents::Populated(
                entry
                    .children
                    .iter()
                    .map(|c| AnalyzedFile::from_known_entry(c, None))
                    .collect(),
            )
        };
        AnalyzedFile {
            name,
            hash: entry.hash,
            size,
            last_modified,
            contents,
        }
    }
}

/// Serializable interior-tree record for the known-file store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownEntry {
    pub name: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
    #[serde(default)]
    pub container: bool,
    #[serde(default)]
    pub children: Vec<KnownEntry>,
}

/// Full path through containers: the structural identity of a nested file,
/// distinct from its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullPath {
    /// Absolute path of the native ancestor.
    pub base: PathBuf,
    /// Relative segments down through each container.
    pub segments: Vec<PathBuf>,
}

impl FullPath {
    pub fn native(base: impl Into<PathBuf>) -> FullPath {
        FullPath {
            base: base.into(),
            segments: Vec::new(),
        }
    }

    pub fn join(&self, segment: impl Into<PathBuf>) -> FullPath {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        FullPath {
            base: self.base.clone(),
            segments,
        }
    }
}

impl fmt::Display for FullPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base.display())?;
        for seg in &self.segments {
            write!(f, "|{}", seg.display())?;
        }
        Ok(())
    }
}

/// Manifest record: "archive with hash `hash` contains, at the relative path
/// chain `parts`, a file". Describes files known from a shared catalog before
/// the enclosing archive is locally present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRelativePath {
    /// Content hash of the top-level archive.
    pub archive: ContentHash,
    /// Relative segments down to the described file, one per container level.
    pub parts: Vec<PathBuf>,
    /// Content hash of the described file itself.
    pub hash: ContentHash,
    /// Size of the described file, when the catalog knows it.
    #[serde(default)]
    pub size: u64,
}

impl fmt::Display for HashRelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.archive)?;
        for part in &self.parts {
            write!(f, "|{}", part.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, bytes: &[u8]) -> AnalyzedFile {
        AnalyzedFile {
            name: FileName::Nested(PathBuf::from(name)),
            hash: ContentHash::of_bytes(bytes),
            size: bytes.len() as u64,
            last_modified: None,
            contents: AnalyzedContents::Opaque,
        }
    }

    fn sample_tree() -> Arc<VirtualFile> {
        let nested_archive = AnalyzedFile {
            name: FileName::Nested(PathBuf::from("inner.zip")),
            hash: ContentHash::of_bytes(b"inner-zip-bytes"),
            size: 64,
            last_modified: None,
            contents: AnalyzedContents::Populated(vec![leaf("deep.txt", b"deep")]),
        };
        let root = AnalyzedFile {
            name: FileName::Native(PathBuf::from("/roots/outer.zip")),
            hash: ContentHash::of_bytes(b"outer-zip-bytes"),
            size: 128,
            last_modified: Some(1_700_000_000_000),
            contents: AnalyzedContents::Populated(vec![leaf("a.txt", b"a"), nested_archive]),
        };
        VirtualFile::freeze(root)
    }

    #[test]
    fn parent_links_are_navigational() {
        let root = sample_tree();
        let inner = root.child(Path::new("inner.zip")).unwrap().clone();
        let deep = inner.child(Path::new("deep.txt")).unwrap().clone();

        assert!(root.parent().is_none());
        assert_eq!(
            deep.parent().unwrap().hash(),
            inner.hash()
        );
        assert_eq!(deep.native_root().hash(), root.hash());

        // Dropping the root drops the whole tree: children do not keep
        // parents alive.
        let weak = Arc::downgrade(&root);
        drop(root);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn full_path_runs_from_native_ancestor() {
        let root = sample_tree();
        let deep = root
            .child(Path::new("inner.zip"))
            .unwrap()
            .child(Path::new("deep.txt"))
            .unwrap()
            .clone();

        let fp = deep.full_path();
        assert_eq!(fp.base, PathBuf::from("/roots/outer.zip"));
        assert_eq!(
            fp.segments,
            vec![PathBuf::from("inner.zip"), PathBuf::from("deep.txt")]
        );
        assert_eq!(fp.to_string(), "/roots/outer.zip|inner.zip|deep.txt");

        // Cached: second call returns the same value.
        assert_eq!(deep.full_path(), fp);
    }

    #[test]
    fn walk_covers_every_node() {
        let root = sample_tree();
        let all = root.walk();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn known_entry_round_trip_preserves_shape() {
        let root = sample_tree();
        let entry = root.to_known_entry();
        assert_eq!(entry.children.len(), 2);

        let rebuilt = VirtualFile::freeze(AnalyzedFile::from_known_entry(
            &entry,
            Some((PathBuf::from("/elsewhere/moved.zip"), 128, Some(42))),
        ));
        assert_eq!(rebuilt.hash(), root.hash());
        assert_eq!(
            rebuilt.name().as_path(),
            Path::new("/elsewhere/moved.zip")
        );
        let inner = rebuilt.child(Path::new("inner.zip")).unwrap();
        assert_eq!(inner.children().len(), 1);
        assert_eq!(
            inner.children()[0].hash(),
            ContentHash::of_bytes(b"deep")
        );
    }

    #[test]
    fn unanalyzed_containers_have_no_children() {
        let file = VirtualFile::freeze(AnalyzedFile {
            name: FileName::Native(PathBuf::from("/roots/sealed.7z")),
            hash: ContentHash::of_bytes(b"sealed"),
            size: 10,
            last_modified: None,
            contents: AnalyzedContents::Unanalyzed,
        });
        assert!(file.is_container());
        assert!(file.children().is_empty());
    }
}
