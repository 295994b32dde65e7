//! The abstract extraction capability.
//!
//! The core never decodes archive formats itself; it depends on an
//! [`Extractor`] per container kind, selected by content classification. One
//! adapter (zip) ships in-tree; 7z, rar, bsa and friends are registered by
//! the embedding application.

mod zip;

pub use self::zip::ZipExtractor;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::VfsError;
use crate::hashing::{self, ContentHash};

/// How many leading bytes classification needs.
pub const HEADER_SNIFF_LEN: usize = 8;

/// Container formats the classifier recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Zip,
    SevenZip,
    Rar,
    Tar,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerKind::Zip => "zip",
            ContainerKind::SevenZip => "7z",
            ContainerKind::Rar => "rar",
            ContainerKind::Tar => "tar",
        };
        f.write_str(name)
    }
}

/// Image formats recognized purely so they are never mistaken for
/// containers; the VFS stores no image metadata beyond this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Dds,
}

/// Classification result for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Plain,
    Image(ImageFormat),
    Container(ContainerKind),
}

impl FileKind {
    pub fn container(self) -> Option<ContainerKind> {
        match self {
            FileKind::Container(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Classify a file from its leading bytes (and, for formats whose signature
/// is not at offset zero, its extension).
pub fn classify(path: &Path, header: &[u8]) -> FileKind {
    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        return FileKind::Container(ContainerKind::Zip);
    }
    if header.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return FileKind::Container(ContainerKind::SevenZip);
    }
    if header.starts_with(b"Rar!\x1a\x07") {
        return FileKind::Container(ContainerKind::Rar);
    }
    if header.starts_with(&[0x89, b'P', b'N', b'G']) {
        return FileKind::Image(ImageFormat::Png);
    }
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return FileKind::Image(ImageFormat::Jpeg);
    }
    if header.starts_with(b"DDS ") {
        return FileKind::Image(ImageFormat::Dds);
    }
    // The ustar magic sits at offset 257, past the sniff window.
    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("tar")) {
        return FileKind::Container(ContainerKind::Tar);
    }
    FileKind::Plain
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// The byte stream an extractor reads: either a native file on disk or bytes
/// previously extracted from an enclosing container.
#[derive(Debug, Clone)]
pub enum ExtractionSource {
    Native(PathBuf),
    Staged(Arc<ExtractedFile>),
}

impl ExtractionSource {
    /// Open the source for random-access reading.
    pub fn open(&self) -> std::io::Result<Box<dyn ReadSeek + Send + '_>> {
        match self {
            ExtractionSource::Native(path) => {
                Ok(Box::new(std::io::BufReader::new(std::fs::File::open(path)?)))
            }
            ExtractionSource::Staged(file) => file.open(),
        }
    }

    /// Re-hash the source bytes. Used only by the corruption check after an
    /// extraction failure, never on the success path.
    pub async fn rehash(&self) -> Result<ContentHash, VfsError> {
        match self {
            ExtractionSource::Native(path) => Ok(hashing::hash_file(path).await?.0),
            ExtractionSource::Staged(file) => {
                let file = Arc::clone(file);
                tokio::task::spawn_blocking(move || file.hash().map(|(h, _)| h))
                    .await
                    .map_err(|e| VfsError::Other(Box::new(e)))?
                    .map_err(VfsError::from)
            }
        }
    }

    /// A human-readable name for log and error messages.
    pub fn describe(&self) -> String {
        match self {
            ExtractionSource::Native(path) => path.display().to_string(),
            ExtractionSource::Staged(_) => "<staged bytes>".to_string(),
        }
    }
}

/// Materialized bytes of one extracted entry: small entries live in memory,
/// larger ones spool to a temp file that disappears on drop.
#[derive(Debug)]
pub enum ExtractedFile {
    Memory(Vec<u8>),
    Spooled(tempfile::NamedTempFile),
}

impl ExtractedFile {
    pub fn size(&self) -> std::io::Result<u64> {
        match self {
            ExtractedFile::Memory(bytes) => Ok(bytes.len() as u64),
            ExtractedFile::Spooled(tmp) => Ok(tmp.as_file().metadata()?.len()),
        }
    }

    pub fn open(&self) -> std::io::Result<Box<dyn ReadSeek + Send + '_>> {
        match self {
            ExtractedFile::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(&bytes[..]))),
            ExtractedFile::Spooled(tmp) => Ok(Box::new(std::io::BufReader::new(
                std::fs::File::open(tmp.path())?,
            ))),
        }
    }

    pub fn hash(&self) -> std::io::Result<(ContentHash, u64)> {
        match self {
            ExtractedFile::Memory(bytes) => {
                Ok((ContentHash::of_bytes(bytes), bytes.len() as u64))
            }
            ExtractedFile::Spooled(tmp) => {
                hashing::hash_reader(std::io::BufReader::new(std::fs::File::open(tmp.path())?))
            }
        }
    }
}

/// Where and how extracted entries are staged.
#[derive(Debug, Clone)]
pub struct Spool {
    /// Directory for spooled temp files; `None` uses the system default.
    pub dir: Option<PathBuf>,
    /// Entries at or below this size stay in memory.
    pub memory_limit: u64,
}

impl Default for Spool {
    fn default() -> Self {
        Spool {
            dir: None,
            memory_limit: 16 * 1024 * 1024,
        }
    }
}

impl Spool {
    /// Drain `reader` into memory or a temp file depending on `size_hint`.
    pub fn stage(&self, size_hint: u64, reader: &mut dyn Read) -> std::io::Result<ExtractedFile> {
        if size_hint <= self.memory_limit {
            let mut buf = Vec::with_capacity(size_hint as usize);
            reader.read_to_end(&mut buf)?;
            Ok(ExtractedFile::Memory(buf))
        } else {
            let mut tmp = match &self.dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    tempfile::NamedTempFile::new_in(dir)?
                }
                None => tempfile::NamedTempFile::new()?,
            };
            std::io::copy(reader, &mut tmp)?;
            Ok(ExtractedFile::Spooled(tmp))
        }
    }
}

/// Which entries a gathering extraction should produce.
#[derive(Debug, Clone)]
pub enum Wanted {
    /// Every entry in the container.
    All,
    /// Exactly these container-relative paths.
    Paths(BTreeSet<PathBuf>),
}

impl Wanted {
    pub fn matches(&self, rel: &Path) -> bool {
        match self {
            Wanted::All => true,
            Wanted::Paths(set) => set.contains(rel),
        }
    }
}

/// Entry stream produced by a gathering extraction.
pub type ExtractedSender = mpsc::Sender<(PathBuf, ExtractedFile)>;

/// One archive-format decoder.
///
/// `gathering_extract` must send exactly the entries matched by `wanted`
/// (exhaustively, order unspecified), then return. Implementations check
/// `cancel` between entries and stop sending once it fires.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> ContainerKind;

    async fn gathering_extract(
        &self,
        source: ExtractionSource,
        wanted: Wanted,
        out: ExtractedSender,
        cancel: CancellationToken,
        spool: Spool,
    ) -> Result<(), VfsError>;
}

/// Extractors by container kind.
pub struct ExtractorRegistry {
    map: HashMap<ContainerKind, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> ExtractorRegistry {
        ExtractorRegistry {
            map: HashMap::new(),
        }
    }

    /// Registry with the in-tree adapters (currently zip only).
    pub fn with_defaults() -> ExtractorRegistry {
        let mut registry = ExtractorRegistry::empty();
        registry.register(Arc::new(ZipExtractor));
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.map.insert(extractor.kind(), extractor);
    }

    pub fn get(&self, kind: ContainerKind) -> Option<Arc<dyn Extractor>> {
        self.map.get(&kind).cloned()
    }
}
