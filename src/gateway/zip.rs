//! In-tree zip adapter for the extraction gateway.
//!
//! The `zip` crate is synchronous, so the whole gathering pass runs under
//! `spawn_blocking` and feeds entries back through the channel with
//! `blocking_send`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ContainerKind, ExtractedSender, ExtractionSource, Extractor, Spool, Wanted};
use crate::error::VfsError;

pub struct ZipExtractor;

#[async_trait]
impl Extractor for ZipExtractor {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Zip
    }

    async fn gathering_extract(
        &self,
        source: ExtractionSource,
        wanted: Wanted,
        out: ExtractedSender,
        cancel: CancellationToken,
        spool: Spool,
    ) -> Result<(), VfsError> {
        tokio::task::spawn_blocking(move || gather_blocking(source, wanted, out, cancel, spool))
            .await
            .map_err(|e| VfsError::Other(Box::new(e)))?
    }
}

fn gather_blocking(
    source: ExtractionSource,
    wanted: Wanted,
    out: ExtractedSender,
    cancel: CancellationToken,
    spool: Spool,
) -> Result<(), VfsError> {
    let describe = source.describe();
    let reader = source
        .open()
        .map_err(|e| VfsError::io(e, PathBuf::from(&describe)))?;
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| VfsError::Extraction {
        path: describe.clone(),
        source: Box::new(e),
    })?;

    let mut sent = 0usize;
    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        let mut entry = archive.by_index(i).map_err(|e| VfsError::Extraction {
            path: describe.clone(),
            source: Box::new(e),
        })?;
        if entry.is_dir() {
            continue;
        }
        let rel = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            // Entries escaping the archive root are never indexed.
            None => continue,
        };
        if !wanted.matches(&rel) {
            continue;
        }
        let staged = spool
            .stage(entry.size(), &mut entry)
            .map_err(|e| VfsError::io(e, PathBuf::from(&describe)))?;
        // Receiver gone means the caller stopped consuming; not an error.
        if out.blocking_send((rel, staged)).is_err() {
            return Ok(());
        }
        sent += 1;
    }
    debug!(container = %describe, entries = sent, "zip gathering complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ExtractedFile;
    use crate::hashing::ContentHash;
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::path::Path;
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn collect(
        source: ExtractionSource,
        wanted: Wanted,
    ) -> Vec<(PathBuf, ExtractedFile)> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let task = tokio::spawn(async move {
            ZipExtractor
                .gathering_extract(
                    source,
                    wanted,
                    tx,
                    CancellationToken::new(),
                    Spool::default(),
                )
                .await
        });
        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item);
        }
        task.await.unwrap().unwrap();
        got
    }

    #[tokio::test]
    async fn gathers_all_entries() {
        let bytes = build_zip(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]);
        let source = ExtractionSource::Staged(std::sync::Arc::new(ExtractedFile::Memory(bytes)));

        let mut got = collect(source, Wanted::All).await;
        got.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, Path::new("a.txt"));
        assert_eq!(got[0].1.hash().unwrap().0, ContentHash::of_bytes(b"alpha"));
        assert_eq!(got[1].0, Path::new("dir/b.txt"));
    }

    #[tokio::test]
    async fn selective_extraction_skips_siblings() {
        let bytes = build_zip(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]);
        let source = ExtractionSource::Staged(std::sync::Arc::new(ExtractedFile::Memory(bytes)));

        let wanted: BTreeSet<PathBuf> = [PathBuf::from("dir/b.txt")].into_iter().collect();
        let got = collect(source, Wanted::Paths(wanted)).await;

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Path::new("dir/b.txt"));
        assert_eq!(got[0].1.hash().unwrap().0, ContentHash::of_bytes(b"beta"));
    }

    #[tokio::test]
    async fn garbage_bytes_fail_cleanly() {
        let source = ExtractionSource::Staged(std::sync::Arc::new(ExtractedFile::Memory(
            b"this is not a zip file".to_vec(),
        )));
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let err = ZipExtractor
            .gathering_extract(
                source,
                Wanted::All,
                tx,
                CancellationToken::new(),
                Spool::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Extraction { .. }));
    }
}
