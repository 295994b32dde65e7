//! # arcvfs Core Library
//!
//! This crate implements a content-addressable virtual filesystem (VFS):
//! a set of on-disk roots — including files nested inside archives nested
//! inside other archives — is indexed into a single queryable, immutable
//! tree, and any subset of those nested files can later be materialized
//! (extracted) on demand.
//!
//! ## Key Modules
//!
//! - [`vfile`]: The immutable [`vfile::VirtualFile`] data model — one node per
//!   native or contained file, addressed by content hash and by full path.
//! - [`index`]: [`index::IndexRoot`] snapshots of the whole forest, replaced
//!   atomically by the `integrate` merge.
//! - [`context`]: The orchestrator. [`context::Context`] exposes `add_roots`,
//!   `extract` and `backfill_missing`.
//! - [`gateway`]: The abstract extraction capability — container
//!   classification, the [`gateway::Extractor`] trait, and the in-tree zip
//!   adapter.
//! - [`hash_cache`] / [`store`]: Persistent caches that make re-indexing of
//!   unchanged files free.
//! - [`limiter`]: The bounded-concurrency gate every I/O-heavy operation runs
//!   under.
//!
//! ## Example
//!
//! ```no_run
//! use arcvfs::context::{Context, VfsConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), arcvfs::VfsError> {
//! let ctx = Context::new(VfsConfig::default());
//! ctx.add_root("/data/downloads".into(), &CancellationToken::new()).await?;
//! for file in ctx.index().iter() {
//!     println!("{} {}", file.hash(), file.full_path());
//! }
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod gateway;
pub mod hash_cache;
pub mod hashing;
pub mod index;
pub mod limiter;
pub mod store;
pub mod vfile;

pub use error::VfsError;
pub use hashing::ContentHash;
