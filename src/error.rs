use std::path::PathBuf;

use thiserror::Error;

use crate::hashing::ContentHash;

/// The primary error type for all operations in the `arcvfs` crate.
#[derive(Debug, Error)]
pub enum VfsError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The operation was cancelled through its cancellation token. Not a
    /// failure; callers unwind without invoking further callbacks.
    #[error("operation cancelled")]
    Cancelled,

    /// Extraction failed and re-hashing the source bytes did not reproduce
    /// the recorded content hash: the file on disk is not the file that was
    /// indexed.
    #[error(
        "source file '{path}' is corrupt (expected hash {expected}, bytes on disk hash to {actual}); \
         delete it and re-download or re-acquire it from its original source"
    )]
    CorruptedSource {
        path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// A container classified as `kind` has no registered extractor.
    #[error("no extractor registered for {kind} container '{}'", path.display())]
    UnsupportedContainer {
        kind: crate::gateway::ContainerKind,
        path: PathBuf,
    },

    /// An archive-format decoder reported a failure for the given file.
    #[error("extraction failed for '{path}': {source}")]
    Extraction {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A persisted cache file carries the wrong magic bytes or version.
    /// Callers must treat the cache as absent and rebuild from scratch.
    #[error("cache file '{}' rejected: {reason}", path.display())]
    CacheFormat { path: PathBuf, reason: String },

    /// The extraction gateway completed without producing an entry it was
    /// asked for.
    #[error("container '{container}' produced no entry for '{}'", entry.display())]
    MissingEntry { container: String, entry: PathBuf },

    /// An error during serialization or deserialization of a cache payload.
    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// A wrapper for any other error that doesn't fit the specific variants.
    #[error("an unexpected error occurred: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl VfsError {
    /// Attach a path to a bare I/O error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        VfsError::Io {
            source,
            path: path.into(),
        }
    }

    /// True when the error is cooperative cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VfsError::Cancelled)
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::Io {
            source: err,
            path: PathBuf::new(), // Generic path
        }
    }
}
