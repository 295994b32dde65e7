//! The VFS orchestrator.
//!
//! A [`Context`] owns the current [`IndexRoot`] snapshot and coordinates the
//! hash cache, the known-file store, the extraction gateway and the resource
//! limiter. It exposes the three public operations of the VFS:
//!
//! - [`Context::add_roots`]: enumerate directory roots, hash everything,
//!   recursively analyze containers, and publish a new index snapshot.
//! - [`Context::extract`]: materialize an arbitrary set of virtual files,
//!   however deeply nested, extracting only what the targets require.
//! - [`Context::add_known`] / [`Context::backfill_missing`]: synthesize
//!   index entries from manifest records for archives that are not locally
//!   present yet.
//!
//! The index pointer is guarded by a lock held only for the in-memory merge
//! and swap; analysis never blocks readers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::VfsError;
use crate::gateway::{
    classify, ExtractedFile, ExtractionSource, ExtractorRegistry, Spool, Wanted, HEADER_SNIFF_LEN,
};
use crate::hash_cache::{mtime_millis, HashCache};
use crate::hashing::ContentHash;
use crate::index::IndexRoot;
use crate::limiter::{ProgressFn, ResourceLimiter};
use crate::store::KnownFileStore;
use crate::vfile::{
    AnalyzedContents, AnalyzedFile, FileName, FullPath, HashRelativePath, KnownEntry, VirtualFile,
};

/// Tuning and storage locations for a [`Context`].
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Concurrency ceiling for all indexing/extraction I/O.
    pub max_concurrency: usize,
    /// Location of the persisted hash cache.
    pub hash_cache_path: PathBuf,
    /// Location of the persisted known-file store.
    pub known_store_path: PathBuf,
    /// Staging policy for extracted entries.
    pub spool: Spool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("arcvfs");
        VfsConfig {
            max_concurrency: num_cpus::get(),
            hash_cache_path: base.join("hashes.avfs"),
            known_store_path: base.join("known.avfs"),
            spool: Spool::default(),
        }
    }
}

/// Outcome summary of one `add_roots` call.
#[derive(Debug, Default)]
pub struct IndexReport {
    /// Files analyzed from scratch this call.
    pub indexed: usize,
    /// Files reused verbatim because (size, mtime) was unchanged.
    pub reused: usize,
    /// Per-file failures; siblings proceed regardless.
    pub failed: Vec<(PathBuf, VfsError)>,
}

/// Outcome summary of one `extract` call.
#[derive(Debug, Default)]
pub struct ExtractReport {
    /// Number of requested files delivered to the callback.
    pub delivered: usize,
    /// Per-target failures, attributed to every requested file inside the
    /// failing subtree (a corrupt container poisons all its descendants).
    pub failed: Vec<(FullPath, Arc<VfsError>)>,
}

/// Callback invoked with each materialized target and a handle to its bytes.
pub type ExtractCallback =
    Arc<dyn Fn(&Arc<VirtualFile>, &ExtractionSource) -> Result<(), VfsError> + Send + Sync>;

/// Shared services handed to analysis tasks.
struct Services {
    limiter: Arc<ResourceLimiter>,
    hash_cache: Arc<HashCache>,
    known: Arc<KnownFileStore>,
    extractors: Arc<ExtractorRegistry>,
    spool: Spool,
}

/// The orchestrator: owns the current index snapshot and the shared caches.
pub struct Context {
    services: Arc<Services>,
    index: RwLock<Arc<IndexRoot>>,
    staged: Mutex<StagedKnown>,
}

#[derive(Default)]
struct StagedKnown {
    records: Vec<HashRelativePath>,
    locations: HashMap<ContentHash, PathBuf>,
}

impl Context {
    pub fn new(config: VfsConfig) -> Context {
        Context::with_extractors(config, ExtractorRegistry::with_defaults())
    }

    /// Build a context with a custom extractor set (tests, extra formats).
    pub fn with_extractors(config: VfsConfig, extractors: ExtractorRegistry) -> Context {
        Context {
            services: Arc::new(Services {
                limiter: Arc::new(ResourceLimiter::new("vfs", config.max_concurrency)),
                hash_cache: Arc::new(HashCache::open(&config.hash_cache_path)),
                known: Arc::new(KnownFileStore::open(&config.known_store_path)),
                extractors: Arc::new(extractors),
                spool: config.spool.clone(),
            }),
            index: RwLock::new(Arc::new(IndexRoot::empty())),
            staged: Mutex::new(StagedKnown::default()),
        }
    }

    /// The current index snapshot. Never blocks on in-flight indexing.
    pub fn index(&self) -> Arc<IndexRoot> {
        Arc::clone(&self.index.read())
    }

    /// Every indexed node whose bytes hash to `hash`.
    pub fn lookup_hash(&self, hash: ContentHash) -> Vec<Arc<VirtualFile>> {
        self.index().by_hash(hash).to_vec()
    }

    /// Structural lookup by full path-through-containers.
    pub fn lookup_path(&self, path: &FullPath) -> Option<Arc<VirtualFile>> {
        self.index().file_for_path(path)
    }

    pub fn hash_cache(&self) -> &HashCache {
        &self.services.hash_cache
    }

    pub fn known_store(&self) -> &KnownFileStore {
        &self.services.known
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.services.limiter
    }

    /// Index a single root directory.
    pub async fn add_root(
        &self,
        root: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<IndexReport, VfsError> {
        self.add_roots(&[root], cancel, None).await
    }

    /// Index a set of root directories.
    ///
    /// Safe to call repeatedly: files whose size and modification time are
    /// unchanged are reused verbatim with no re-hash and no re-extraction.
    /// Entries outside the scanned roots are never removed. On cancellation
    /// the previous snapshot stays current and untouched.
    pub async fn add_roots(
        &self,
        roots: &[PathBuf],
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<IndexReport, VfsError> {
        let prev = self.index();

        // Step 1: find previously known entries whose files have vanished.
        // The existence probes run on the blocking pool.
        let stale: HashSet<PathBuf> = {
            let known: Vec<PathBuf> = prev
                .roots()
                .map(|r| r.name().as_path().to_path_buf())
                .collect();
            tokio::task::spawn_blocking(move || {
                known.into_iter().filter(|p| !p.exists()).collect()
            })
            .await
            .map_err(|e| VfsError::Other(Box::new(e)))?
        };

        // Step 2: enumerate native files under the roots (no symlinks).
        // Unreadable directories become per-path failures, not a fatal error.
        let (files, walk_failed) = enumerate_files(roots.to_vec()).await?;
        let total = files.len() as u64;
        self.services.limiter.add_to_total(total);
        info!(roots = roots.len(), files = total, "indexing roots");

        // Step 3: hash/analyze/reuse, bounded by the limiter.
        let mut set: JoinSet<(PathBuf, Result<(Arc<VirtualFile>, bool), VfsError>)> =
            JoinSet::new();
        for path in files {
            let services = Arc::clone(&self.services);
            let prev = Arc::clone(&prev);
            let cancel = cancel.clone();
            let progress = progress.clone();
            set.spawn(async move {
                let outcome =
                    index_one(&services, &prev, &path, &cancel, progress.as_ref()).await;
                (path, outcome)
            });
        }

        let mut report = IndexReport {
            failed: walk_failed,
            ..IndexReport::default()
        };
        let mut fresh = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (path, outcome) = joined.map_err(|e| VfsError::Other(Box::new(e)))?;
            match outcome {
                Ok((file, reused)) => {
                    if reused {
                        report.reused += 1;
                    } else {
                        report.indexed += 1;
                    }
                    fresh.push(file);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    warn!(file = %path.display(), %err, "indexing failed");
                    report.failed.push((path, err));
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }

        // Step 4: merge into the snapshot current at publish time, so a
        // concurrent call over other roots keeps its entries. The lock
        // covers only the in-memory merge and swap.
        let next = {
            let mut guard = self.index.write();
            let next = Arc::new(guard.retain_roots(|p| !stale.contains(p)).integrate(fresh));
            *guard = Arc::clone(&next);
            next
        };
        info!(
            indexed = report.indexed,
            reused = report.reused,
            failed = report.failed.len(),
            nodes = next.len(),
            "index snapshot published"
        );

        self.cleanup_and_save(&next).await;
        Ok(report)
    }

    /// Materialize `targets` (native or arbitrarily nested), delivering each
    /// one's bytes to `callback` exactly once.
    ///
    /// Only containers on an ancestor chain of some target are opened, and
    /// each is asked only for the entries those chains require. `parallel`
    /// fans sibling subtrees out under the limiter; sequential mode walks
    /// them in enumeration order.
    pub async fn extract(
        &self,
        targets: &[Arc<VirtualFile>],
        callback: ExtractCallback,
        cancel: &CancellationToken,
        temp_dir: Option<PathBuf>,
        parallel: bool,
    ) -> Result<ExtractReport, VfsError> {
        let plan = Arc::new(ExtractPlan::build(targets));
        let spool = Spool {
            dir: temp_dir,
            ..self.services.spool.clone()
        };
        info!(
            targets = targets.len(),
            containers = plan.nodes.len(),
            parallel,
            "extracting"
        );

        let mut report = ExtractReport::default();
        let roots: Vec<FullPath> = plan.roots.clone();
        if parallel {
            let mut set = JoinSet::new();
            for root in roots {
                let services = Arc::clone(&self.services);
                let plan = Arc::clone(&plan);
                let callback = Arc::clone(&callback);
                let cancel = cancel.clone();
                let spool = spool.clone();
                set.spawn(async move {
                    let Some(node) = plan.node(&root) else {
                        return SubtreeOutcome::default();
                    };
                    let source = ExtractionSource::Native(node.name().as_path().to_path_buf());
                    extract_node(&services, &plan, root, source, &callback, &cancel, &spool, true)
                        .await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => report.absorb(outcome),
                    Err(err) => warn!(%err, "extraction task aborted"),
                }
            }
        } else {
            for root in roots {
                let Some(node) = plan.node(&root) else {
                    continue;
                };
                let source = ExtractionSource::Native(node.name().as_path().to_path_buf());
                let outcome = extract_node(
                    &self.services,
                    &plan,
                    root,
                    source,
                    &callback,
                    cancel,
                    &spool,
                    false,
                )
                .await;
                report.absorb(outcome);
            }
        }
        if cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        Ok(report)
    }

    /// Stage manifest records and archive locations for `backfill_missing`.
    pub fn add_known(
        &self,
        records: impl IntoIterator<Item = HashRelativePath>,
        locations: HashMap<ContentHash, PathBuf>,
    ) {
        let mut staged = self.staged.lock();
        staged.records.extend(records);
        staged.locations.extend(locations);
    }

    /// Synthesize index entries for every staged manifest record whose
    /// archive hash has a known target location, without touching any bytes.
    pub async fn backfill_missing(&self) -> Result<(), VfsError> {
        let (records, locations) = {
            let mut staged = self.staged.lock();
            (
                std::mem::take(&mut staged.records),
                std::mem::take(&mut staged.locations),
            )
        };
        if records.is_empty() {
            return Ok(());
        }

        let mut by_archive: BTreeMap<ContentHash, Vec<HashRelativePath>> = BTreeMap::new();
        for record in records {
            by_archive.entry(record.archive).or_default().push(record);
        }

        // Size/mtime of each synthetic root comes from its target path when
        // the file already exists; probe them on the blocking pool.
        let identities: HashMap<ContentHash, (u64, Option<u64>)> = {
            let probes: Vec<(ContentHash, PathBuf)> = by_archive
                .keys()
                .filter_map(|hash| locations.get(hash).map(|p| (*hash, p.clone())))
                .collect();
            tokio::task::spawn_blocking(move || {
                probes
                    .into_iter()
                    .map(|(hash, path)| {
                        let identity = std::fs::metadata(&path)
                            .ok()
                            .map(|m| (m.len(), mtime_millis(&m).ok()))
                            .unwrap_or((0, None));
                        (hash, identity)
                    })
                    .collect()
            })
            .await
            .map_err(|e| VfsError::Other(Box::new(e)))?
        };

        let mut synthesized = Vec::new();
        for (archive, records) in by_archive {
            let Some(location) = locations.get(&archive) else {
                debug!(%archive, "no location for archive, skipping backfill");
                continue;
            };
            let identity = identities.get(&archive).copied().unwrap_or((0, None));
            synthesized.push(synthesize_archive(archive, location, identity, &records));
        }
        let count = synthesized.len();

        // Merge into the snapshot current at publish time; a concurrent
        // indexing call keeps its entries.
        let next = {
            let mut guard = self.index.write();
            let next = Arc::new(guard.integrate(synthesized));
            *guard = Arc::clone(&next);
            next
        };
        info!(archives = count, nodes = next.len(), "backfilled manifest records");
        Ok(())
    }

    /// Prune both caches to what the new snapshot references, then persist.
    /// Store scans and writes run on the blocking pool.
    async fn cleanup_and_save(&self, root: &IndexRoot) {
        let referenced: HashSet<ContentHash> = root
            .iter()
            .filter(|n| n.is_container())
            .map(|n| n.hash())
            .collect();
        let services = Arc::clone(&self.services);
        let done = tokio::task::spawn_blocking(move || {
            services.known.clean(&referenced);
            services.hash_cache.clean();
            if let Err(err) = services.known.save() {
                warn!(%err, "failed to persist known-file store");
            }
            if let Err(err) = services.hash_cache.save() {
                warn!(%err, "failed to persist hash cache");
            }
        })
        .await;
        if let Err(err) = done {
            warn!(%err, "cache persistence task aborted");
        }
    }
}

/// Enumerate all regular files under the roots, directories only, never
/// following symlinks. An unreadable directory fails that path alone and
/// the walk continues.
async fn enumerate_files(
    roots: Vec<PathBuf>,
) -> Result<(Vec<PathBuf>, Vec<(PathBuf, VfsError)>), VfsError> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let mut failed = Vec::new();
        for root in &roots {
            for entry in walkdir::WalkDir::new(root).follow_links(false) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                    Ok(_) => {}
                    Err(e) => {
                        let path =
                            e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        let err = match e.into_io_error() {
                            Some(io) => VfsError::io(io, path.clone()),
                            None => VfsError::Other("walk error".into()),
                        };
                        warn!(path = %path.display(), %err, "directory walk failed");
                        failed.push((path, err));
                    }
                }
            }
        }
        files.sort();
        (files, failed)
    })
    .await
    .map_err(|e| VfsError::Other(Box::new(e)))
}

/// Index one native file: reuse the previous node when identity matches,
/// otherwise hash, classify, and analyze containers recursively.
async fn index_one(
    services: &Services,
    prev: &IndexRoot,
    path: &Path,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
) -> Result<(Arc<VirtualFile>, bool), VfsError> {
    let job = services
        .limiter
        .begin_job(format!("index {}", path.display()), cancel)
        .await?;

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| VfsError::io(e, path))?;
    let mtime = mtime_millis(&meta).map_err(|e| VfsError::io(e, path))?;

    if let Some(existing) = prev.native(path) {
        if existing.size() == meta.len() && existing.last_modified() == Some(mtime) {
            debug!(file = %path.display(), "unchanged, reusing index entry");
            job.report_done(progress);
            return Ok((Arc::clone(existing), true));
        }
    }

    let analyzed = analyze_native(services, path, cancel).await?;
    job.report_done(progress);
    Ok((VirtualFile::freeze(analyzed), false))
}

async fn analyze_native(
    services: &Services,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<AnalyzedFile, VfsError> {
    let (hash, size, mtime) = services.hash_cache.get_or_compute(path).await?;
    let header = read_header(path).await?;
    let contents = match classify(path, &header).container() {
        None => AnalyzedContents::Opaque,
        Some(kind) => {
            let source = ExtractionSource::Native(path.to_path_buf());
            analyze_container(services, path.to_path_buf(), source, kind, hash, cancel).await?
        }
    };
    Ok(AnalyzedFile {
        name: FileName::Native(path.to_path_buf()),
        hash,
        size,
        last_modified: Some(mtime),
        contents,
    })
}

/// Discover a container's interior: from the known-file store when the same
/// bytes were analyzed before, otherwise by a full gathering extraction.
async fn analyze_container(
    services: &Services,
    name: PathBuf,
    source: ExtractionSource,
    kind: crate::gateway::ContainerKind,
    hash: ContentHash,
    cancel: &CancellationToken,
) -> Result<AnalyzedContents, VfsError> {
    if let Some(entry) = services.known.lookup(hash) {
        debug!(container = %name.display(), "interior known, skipping extraction");
        return Ok(AnalyzedContents::Populated(
            entry
                .children
                .iter()
                .map(|c| AnalyzedFile::from_known_entry(c, None))
                .collect(),
        ));
    }

    let Some(extractor) = services.extractors.get(kind) else {
        debug!(container = %name.display(), %kind, "no extractor, leaving unanalyzed");
        return Ok(AnalyzedContents::Unanalyzed);
    };

    let (tx, mut rx) = mpsc::channel(8);
    let gather = tokio::spawn({
        let cancel = cancel.clone();
        let spool = services.spool.clone();
        let source = source.clone();
        async move { extractor.gathering_extract(source, Wanted::All, tx, cancel, spool).await }
    });

    let mut children = Vec::new();
    let mut child_err = None;
    while let Some((rel, staged)) = rx.recv().await {
        if cancel.is_cancelled() {
            child_err = Some(VfsError::Cancelled);
            break;
        }
        match analyze_staged(services, rel, staged, cancel).await {
            Ok(child) => children.push(child),
            Err(err) => {
                child_err = Some(err);
                break;
            }
        }
    }
    drop(rx);
    let gathered = gather.await.map_err(|e| VfsError::Other(Box::new(e)))?;
    if let Some(err) = child_err {
        return Err(err);
    }
    gathered?;

    children.sort_by(|a, b| a.name.as_path().cmp(b.name.as_path()));
    services
        .known
        .record(hash, known_from_parts(&name, hash, &children));
    Ok(AnalyzedContents::Populated(children))
}

/// Analyze one extracted entry. Nested work runs inside the slot already
/// held for the native file; re-acquiring per nesting level could exhaust
/// the semaphore and deadlock the recursion.
fn analyze_staged<'a>(
    services: &'a Services,
    rel: PathBuf,
    staged: ExtractedFile,
    cancel: &'a CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = Result<AnalyzedFile, VfsError>> + Send + 'a>> {
    Box::pin(async move {
        let staged = Arc::new(staged);
        let (hash, size) = {
            let staged = Arc::clone(&staged);
            tokio::task::spawn_blocking(move || staged.hash())
                .await
                .map_err(|e| VfsError::Other(Box::new(e)))?
                .map_err(VfsError::from)?
        };

        let header = staged_header(&staged)?;
        let contents = match classify(&rel, &header).container() {
            None => AnalyzedContents::Opaque,
            Some(kind) => {
                let source = ExtractionSource::Staged(Arc::clone(&staged));
                analyze_container(services, rel.clone(), source, kind, hash, cancel).await?
            }
        };
        Ok(AnalyzedFile {
            name: FileName::Nested(rel),
            hash,
            size,
            last_modified: None,
            contents,
        })
    })
}

fn known_from_parts(name: &Path, hash: ContentHash, children: &[AnalyzedFile]) -> KnownEntry {
    KnownEntry {
        name: name.to_path_buf(),
        hash,
        size: 0, // identity of the top node comes from disk on reuse
        container: true,
        children: children.iter().map(known_from_analyzed).collect(),
    }
}

fn known_from_analyzed(file: &AnalyzedFile) -> KnownEntry {
    let (container, children) = match &file.contents {
        AnalyzedContents::Opaque => (false, Vec::new()),
        AnalyzedContents::Unanalyzed => (true, Vec::new()),
        AnalyzedContents::Populated(kids) => {
            (true, kids.iter().map(known_from_analyzed).collect())
        }
    };
    KnownEntry {
        name: file.name.as_path().to_path_buf(),
        hash: file.hash,
        size: file.size,
        container,
        children,
    }
}

async fn read_header(path: &Path) -> Result<Vec<u8>, VfsError> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| VfsError::io(e, path))?;
    let mut buf = vec![0u8; HEADER_SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| VfsError::io(e, path))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn staged_header(staged: &ExtractedFile) -> Result<Vec<u8>, VfsError> {
    use std::io::Read;
    let mut reader = staged.open().map_err(VfsError::from)?;
    let mut buf = vec![0u8; HEADER_SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).map_err(VfsError::from)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Extraction planning and execution
// ---------------------------------------------------------------------------

/// One container (or target) on an ancestor chain.
struct PlanEntry {
    node: Arc<VirtualFile>,
    /// Deliver this node's bytes to the callback.
    requested: bool,
    /// Relative name → full path of each required direct child.
    children: BTreeMap<PathBuf, FullPath>,
}

/// Deduplicated ancestor-chain map for one extract call.
struct ExtractPlan {
    nodes: HashMap<FullPath, PlanEntry>,
    /// Native chain tops, in enumeration order.
    roots: Vec<FullPath>,
}

impl ExtractPlan {
    fn build(targets: &[Arc<VirtualFile>]) -> ExtractPlan {
        let mut nodes: HashMap<FullPath, PlanEntry> = HashMap::new();
        let mut roots = Vec::new();
        for target in targets {
            // Walk the chain root → target, creating entries on demand.
            let mut chain = vec![Arc::clone(target)];
            let mut current = Arc::clone(target);
            while let Some(parent) = current.parent() {
                chain.push(Arc::clone(&parent));
                current = parent;
            }
            chain.reverse();

            let root_path = chain[0].full_path().clone();
            if !nodes.contains_key(&root_path) {
                roots.push(root_path.clone());
            }
            for window in 0..chain.len() {
                let node = &chain[window];
                let path = node.full_path().clone();
                let entry = nodes.entry(path.clone()).or_insert_with(|| PlanEntry {
                    node: Arc::clone(node),
                    requested: false,
                    children: BTreeMap::new(),
                });
                if window + 1 < chain.len() {
                    let child = &chain[window + 1];
                    entry.children.insert(
                        child.name().as_path().to_path_buf(),
                        child.full_path().clone(),
                    );
                }
            }
            if let Some(entry) = nodes.get_mut(target.full_path()) {
                entry.requested = true;
            }
        }
        roots.sort();
        ExtractPlan { nodes, roots }
    }

    fn entry(&self, path: &FullPath) -> Option<&PlanEntry> {
        self.nodes.get(path)
    }

    fn node(&self, path: &FullPath) -> Option<&Arc<VirtualFile>> {
        self.entry(path).map(|entry| &entry.node)
    }

    /// Every requested target at or below `path`.
    fn targets_under(&self, path: &FullPath) -> Vec<FullPath> {
        let mut out = Vec::new();
        let mut stack = vec![path.clone()];
        while let Some(current) = stack.pop() {
            let Some(entry) = self.entry(&current) else {
                continue;
            };
            if entry.requested {
                out.push(current.clone());
            }
            stack.extend(entry.children.values().cloned());
        }
        out
    }
}

/// Delivered/failed tallies for one plan subtree.
#[derive(Default)]
struct SubtreeOutcome {
    delivered: usize,
    failed: Vec<(FullPath, Arc<VfsError>)>,
}

impl SubtreeOutcome {
    fn absorb(&mut self, other: SubtreeOutcome) {
        self.delivered += other.delivered;
        self.failed.extend(other.failed);
    }

    /// Attribute `err` to every requested target at or below `path`.
    /// Cancellation is not a failure; the whole call reports it instead.
    fn fail_under(&mut self, plan: &ExtractPlan, path: &FullPath, err: &Arc<VfsError>) {
        if err.is_cancelled() {
            return;
        }
        for target in plan.targets_under(path) {
            self.failed.push((target, Arc::clone(err)));
        }
    }
}

impl ExtractReport {
    fn absorb(&mut self, outcome: SubtreeOutcome) {
        self.delivered += outcome.delivered;
        self.failed.extend(outcome.failed);
    }
}

/// Materialize one plan node: deliver it if requested, then selectively
/// extract its required children and recurse into each one independently.
/// A failure inside one child subtree is attributed to that subtree's
/// targets only; sibling subtrees keep going.
#[allow(clippy::too_many_arguments)]
fn extract_node<'a>(
    services: &'a Arc<Services>,
    plan: &'a Arc<ExtractPlan>,
    path: FullPath,
    source: ExtractionSource,
    callback: &'a ExtractCallback,
    cancel: &'a CancellationToken,
    spool: &'a Spool,
    parallel: bool,
) -> Pin<Box<dyn std::future::Future<Output = SubtreeOutcome> + Send + 'a>> {
    Box::pin(async move {
        let mut outcome = SubtreeOutcome::default();
        // Plan paths always resolve; build() made an entry for every chain
        // node it handed out.
        let Some(entry) = plan.entry(&path) else {
            return outcome;
        };

        // The slot covers callback delivery and the gathering I/O, but is
        // released before recursing so nested levels cannot exhaust the
        // semaphore.
        let children: Vec<(FullPath, ExtractedFile)> = {
            let job = match services
                .limiter
                .begin_job(format!("extract {path}"), cancel)
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    outcome.fail_under(plan, &path, &Arc::new(err));
                    return outcome;
                }
            };

            if entry.requested {
                match (**callback)(&entry.node, &source) {
                    Ok(()) => outcome.delivered += 1,
                    Err(err) if err.is_cancelled() => return outcome,
                    // A delivery failure is this file's alone; its
                    // descendants are still reachable.
                    Err(err) => outcome.failed.push((path.clone(), Arc::new(err))),
                }
            }
            if entry.children.is_empty() {
                drop(job);
                return outcome;
            }

            match gather_children(services, entry, &path, &source, cancel, spool).await {
                Ok(children) => children,
                Err(err) => {
                    // Without the container's entries nothing below this
                    // node is reachable; a corrupt source poisons all of
                    // its descendants the same way.
                    let err = Arc::new(err);
                    for child in entry.children.values() {
                        outcome.fail_under(plan, child, &err);
                    }
                    return outcome;
                }
            }
        };

        if parallel {
            let mut set = JoinSet::new();
            for (child_path, staged) in children {
                let services = Arc::clone(services);
                let plan = Arc::clone(plan);
                let callback = Arc::clone(callback);
                let cancel = cancel.clone();
                let spool = spool.clone();
                set.spawn(async move {
                    let source = ExtractionSource::Staged(Arc::new(staged));
                    extract_node(
                        &services, &plan, child_path, source, &callback, &cancel, &spool, true,
                    )
                    .await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(sub) => outcome.absorb(sub),
                    Err(err) => warn!(%err, "extraction task aborted"),
                }
            }
        } else {
            for (child_path, staged) in children {
                if cancel.is_cancelled() {
                    break;
                }
                let source = ExtractionSource::Staged(Arc::new(staged));
                let sub = extract_node(
                    services, plan, child_path, source, callback, cancel, spool, false,
                )
                .await;
                outcome.absorb(sub);
            }
        }
        outcome
    })
}

/// Run the gateway for exactly the required direct children of one
/// container. On failure, re-hash the container's bytes: a mismatch against
/// the recorded hash means the source itself is corrupt.
async fn gather_children(
    services: &Services,
    entry: &PlanEntry,
    path: &FullPath,
    source: &ExtractionSource,
    cancel: &CancellationToken,
    spool: &Spool,
) -> Result<Vec<(FullPath, ExtractedFile)>, VfsError> {
    let result = gather_children_inner(services, entry, path, source, cancel, spool).await;
    match result {
        Ok(children) => Ok(children),
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            let actual = source.rehash().await?;
            if actual != entry.node.hash() {
                warn!(container = %path, "extraction failed and source bytes do not match the index");
                Err(VfsError::CorruptedSource {
                    path: path.to_string(),
                    expected: entry.node.hash(),
                    actual,
                })
            } else {
                // Bytes are intact; the failure is the extractor's to explain.
                Err(err)
            }
        }
    }
}

async fn gather_children_inner(
    services: &Services,
    entry: &PlanEntry,
    path: &FullPath,
    source: &ExtractionSource,
    cancel: &CancellationToken,
    spool: &Spool,
) -> Result<Vec<(FullPath, ExtractedFile)>, VfsError> {
    let node_path = entry.node.name().as_path();
    let header = match source {
        ExtractionSource::Native(p) => read_header(p).await?,
        ExtractionSource::Staged(staged) => staged_header(staged)?,
    };
    let kind = classify(node_path, &header)
        .container()
        .ok_or_else(|| VfsError::Extraction {
            path: path.to_string(),
            source: "indexed as a container but bytes no longer classify as one".into(),
        })?;
    let extractor =
        services
            .extractors
            .get(kind)
            .ok_or_else(|| VfsError::UnsupportedContainer {
                kind,
                path: node_path.to_path_buf(),
            })?;

    let wanted: BTreeSet<PathBuf> = entry.children.keys().cloned().collect();
    let mut remaining = wanted.clone();

    let (tx, mut rx) = mpsc::channel(8);
    let gather = tokio::spawn({
        let cancel = cancel.clone();
        let spool = spool.clone();
        let source = source.clone();
        async move {
            extractor
                .gathering_extract(source, Wanted::Paths(wanted), tx, cancel, spool)
                .await
        }
    });

    let mut children = Vec::new();
    while let Some((rel, staged)) = rx.recv().await {
        if let Some(child_path) = entry.children.get(&rel) {
            remaining.remove(&rel);
            children.push((child_path.clone(), staged));
        }
    }
    gather.await.map_err(|e| VfsError::Other(Box::new(e)))??;

    if let Some(missing) = remaining.into_iter().next() {
        return Err(VfsError::MissingEntry {
            container: path.to_string(),
            entry: missing,
        });
    }
    Ok(children)
}

// ---------------------------------------------------------------------------
// Manifest backfill
// ---------------------------------------------------------------------------

struct SynthNode {
    hash: ContentHash,
    size: u64,
    children: BTreeMap<PathBuf, SynthNode>,
}

/// Build a synthetic archive tree from manifest records: intermediate
/// containers are memoized per (parent, segment), leaves carry the manifest
/// hash and size. `identity` is the (size, mtime) of the target path,
/// probed by the caller.
fn synthesize_archive(
    archive: ContentHash,
    location: &Path,
    identity: (u64, Option<u64>),
    records: &[HashRelativePath],
) -> Arc<VirtualFile> {
    let mut root = SynthNode {
        hash: archive,
        size: 0,
        children: BTreeMap::new(),
    };
    for record in records {
        let mut cursor = &mut root;
        for (i, part) in record.parts.iter().enumerate() {
            cursor = cursor.children.entry(part.clone()).or_insert_with(|| SynthNode {
                hash: ContentHash::UNKNOWN,
                size: 0,
                children: BTreeMap::new(),
            });
            if i + 1 == record.parts.len() {
                cursor.hash = record.hash;
                cursor.size = record.size;
            }
        }
    }

    let (size, mtime) = identity;

    fn to_analyzed(name: PathBuf, node: SynthNode) -> AnalyzedFile {
        let contents = if node.children.is_empty() {
            AnalyzedContents::Opaque
        } else {
            AnalyzedContents::Populated(
                node.children
                    .into_iter()
                    .map(|(name, child)| to_analyzed(name, child))
                    .collect(),
            )
        };
        AnalyzedFile {
            name: FileName::Nested(name),
            hash: node.hash,
            size: node.size,
            last_modified: None,
            contents,
        }
    }

    VirtualFile::freeze(AnalyzedFile {
        name: FileName::Native(location.to_path_buf()),
        hash: archive,
        size,
        last_modified: mtime,
        contents: AnalyzedContents::Populated(
            root.children
                .into_iter()
                .map(|(name, child)| to_analyzed(name, child))
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(archive: &[u8], parts: &[&str], leaf: &[u8]) -> HashRelativePath {
        HashRelativePath {
            archive: ContentHash::of_bytes(archive),
            parts: parts.iter().map(PathBuf::from).collect(),
            hash: ContentHash::of_bytes(leaf),
            size: leaf.len() as u64,
        }
    }

    #[test]
    fn synthesize_builds_intermediate_containers() {
        let archive = ContentHash::of_bytes(b"arc");
        let records = vec![
            record(b"arc", &["p1"], b"leaf1"),
            record(b"arc", &["p2", "p3"], b"leaf2"),
            record(b"arc", &["p2", "p4"], b"leaf3"),
        ];
        let root = synthesize_archive(archive, Path::new("/downloads/arc.7z"), (0, None), &records);

        assert_eq!(root.hash(), archive);
        assert_eq!(root.children().len(), 2);

        let p2 = root.child(Path::new("p2")).unwrap();
        assert!(p2.hash().is_unknown());
        assert_eq!(p2.children().len(), 2);
        assert_eq!(
            p2.child(Path::new("p3")).unwrap().hash(),
            ContentHash::of_bytes(b"leaf2")
        );
    }

    #[test]
    fn plan_dedups_shared_ancestors() {
        let archive = ContentHash::of_bytes(b"arc");
        let records = vec![
            record(b"arc", &["dir", "a.txt"], b"a"),
            record(b"arc", &["dir", "b.txt"], b"b"),
        ];
        let root = synthesize_archive(archive, Path::new("/d/arc.zip"), (0, None), &records);
        let dir = root.child(Path::new("dir")).unwrap();
        let a = dir.child(Path::new("a.txt")).unwrap().clone();
        let b = dir.child(Path::new("b.txt")).unwrap().clone();

        let plan = ExtractPlan::build(&[a, b]);
        // root + dir + two leaves
        assert_eq!(plan.nodes.len(), 4);
        assert_eq!(plan.roots.len(), 1);

        let root_entry = plan.entry(&FullPath::native("/d/arc.zip")).unwrap();
        assert!(!root_entry.requested);
        assert_eq!(root_entry.children.len(), 1);

        let dir_entry = plan.entry(&FullPath::native("/d/arc.zip").join("dir")).unwrap();
        assert_eq!(dir_entry.children.len(), 2);
        assert_eq!(plan.targets_under(&FullPath::native("/d/arc.zip")).len(), 2);
    }

    #[test]
    fn plan_lookup_misses_are_none() {
        let plan = ExtractPlan::build(&[]);
        let nowhere = FullPath::native("/nowhere/at/all.zip");
        assert!(plan.entry(&nowhere).is_none());
        assert!(plan.node(&nowhere).is_none());
        assert!(plan.targets_under(&nowhere).is_empty());
    }
}
