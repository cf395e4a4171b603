//! Block-addressable local cache for remote files
//!
//! Remote resources are cached per URL as fixed-size blocks fetched on
//! demand. Entries are safe to share between processes: every mutation
//! happens under a PID-tagged lock file.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/<sha1(url)>/META
//! <cache_dir>/<sha1(url)>/blocks/block-<cid>            whole content
//! <cache_dir>/<sha1(url)>/blocks/block-<cid>-<offset>   one block
//! <cache_dir>/<sha1(url)>/links/<cid>/<basename>        hardlink to whole content
//! <cache_dir>/<sha1(url)>.lock                          entry lock
//! ```
//!
//! # Content identity
//!
//! | Field | Source |
//! |-------|--------|
//! | url | requested URL |
//! | block_size | configuration or caller |
//! | size | backend stat |
//! | tag | ETag, mtime or generation |
//!
//! The `cid` hashes all of the above. Blocks embed the `cid` in their file
//! name, so blocks of an old generation are never served and get purged
//! once they are older than the configured max age.

pub mod block_file;
pub mod cached_file;
pub mod cleanup;
pub mod interface;
pub mod lockfile;
pub mod meta;
pub mod objects;

#[cfg(test)]
pub(crate) mod testing;

pub use block_file::{Block, BlockReader, BlockSpan, CachedBlockFile, PurgeReport};
pub use cached_file::CachedFile;
pub use cleanup::{cleanup_cache, maybe_cleanup_cache, CleanupPolicy, CleanupReport};
pub use interface::CacheInterface;
pub use lockfile::{LockFile, LockGuard, LockSettings, LockTag};
pub use meta::{load_meta, prepare_meta, save_meta, Meta, MetaSeed};
pub use objects::ObjectCache;

use crate::error::{GfsError, GfsResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome of an action whose failure must not affect the primary operation
#[must_use = "log or inspect best-effort outcomes"]
#[derive(Debug)]
pub enum BestEffort {
    /// The action succeeded
    Done,
    /// The action failed and was skipped
    Failed { action: String, error: GfsError },
}

impl BestEffort {
    /// Wrap the result of `action`
    pub fn from_result(action: impl Into<String>, result: GfsResult<()>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(error) => Self::Failed {
                action: action.into(),
                error,
            },
        }
    }

    /// Whether the action succeeded
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Log a failure as a warning and drop it
    pub fn log(self) {
        if let Self::Failed { action, error } = self {
            warn!("{} failed (ignored): {}", action, error);
        }
    }
}

/// Paths of the entries in `dir`; a missing directory is empty
pub(crate) fn list_dir(dir: &Path) -> GfsResult<Vec<PathBuf>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(|e| e.ok().map(|e| e.path())).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(GfsError::io(format!("listing {}", dir.display()), e)),
    }
}
