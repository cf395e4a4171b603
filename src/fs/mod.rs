//! Filesystem backends
//!
//! Every protocol implements [`FileSystem`]. Backends are described by a
//! [`FsDescriptor`] (protocol ids plus a factory) and instantiated lazily
//! by the registry with a shared [`FsContext`].

pub mod file_fs;
pub mod ftp_fs;
pub mod gcs_fs;
pub mod handle;
pub mod http_fs;
pub mod s3_fs;
pub mod url;

pub use handle::{GfsFile, Upload};

use crate::cache::{CacheInterface, MetaSeed};
use crate::config::Config;
use crate::error::{GfsError, GfsResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Kind of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// Result of a `stat` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    /// Normalized URL
    pub url: String,
    pub kind: FileKind,
    /// Content length, when the backend reports one
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Backend content tag (ETag, generation, ...)
    pub tag: Option<String>,
}

impl FileStat {
    pub fn file(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: FileKind::File,
            size: None,
            modified: None,
            tag: None,
        }
    }

    pub fn directory(url: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::file(url)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Identity information for the cache.
    ///
    /// Falls back to the modification time when the backend has no tag.
    pub fn seed(&self) -> MetaSeed {
        let tag = self
            .tag
            .clone()
            .or_else(|| self.modified.map(|m| m.to_rfc3339()));
        MetaSeed::new().with_size(self.size).with_tag(tag)
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Name relative to the listed directory
    pub name: String,
    /// Full URL of the entry
    pub url: String,
    pub kind: FileKind,
    pub size: Option<u64>,
}

/// How [`FileSystem::open`] opens a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate
    Write,
    /// Create or append
    Append,
}

/// Operations every backend provides.
///
/// Operations a protocol cannot express fail with
/// [`GfsError::Unsupported`].
pub trait FileSystem: Send + Sync {
    /// Primary protocol id
    fn id(&self) -> &'static str;

    /// Canonical form of `url` for this backend
    fn norm_url(&self, url: &str) -> GfsResult<String>;

    fn stat(&self, url: &str) -> GfsResult<FileStat>;

    fn open(&self, url: &str, mode: OpenMode) -> GfsResult<GfsFile>;

    /// Remove a file
    fn remove(&self, url: &str) -> GfsResult<()>;

    /// Rename within this backend
    fn rename(&self, src: &str, dst: &str) -> GfsResult<()>;

    fn mkdir(&self, url: &str) -> GfsResult<()>;

    /// Create a directory and its parents
    fn makedirs(&self, url: &str, exist_ok: bool) -> GfsResult<()>;

    /// Remove an empty directory
    fn rmdir(&self, url: &str) -> GfsResult<()>;

    fn list(&self, url: &str) -> GfsResult<Vec<DirEntry>>;

    /// Upload the local file at `local` to `url`
    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()>;

    /// Remove a directory tree, depth first
    fn rmtree(&self, url: &str, ignore_errors: bool) -> GfsResult<()> {
        let result = (|| {
            for entry in self.list(url)? {
                match entry.kind {
                    FileKind::Directory => self.rmtree(&entry.url, ignore_errors)?,
                    FileKind::File => self.remove(&entry.url)?,
                }
            }
            self.rmdir(url)
        })();
        match result {
            Err(e) if ignore_errors => {
                warn!("Ignoring error while removing {}: {}", url, e);
                Ok(())
            }
            other => other,
        }
    }

    /// Download `url` into the local file at `local`
    fn get_file(&self, url: &str, local: &Path) -> GfsResult<()> {
        let mut source = self.open(url, OpenMode::Read)?;
        let mut target =
            File::create(local).map_err(|e| GfsError::from_io_at(local, "creating", e))?;
        std::io::copy(&mut source, &mut target)
            .map_err(|e| GfsError::io(format!("downloading {}", url), e))?;
        Ok(())
    }

    /// Local path holding the content of `url`
    fn as_local(&self, _url: &str) -> GfsResult<PathBuf> {
        Err(self.unsupported("as_local"))
    }

    /// Error for an operation this backend cannot perform
    fn unsupported(&self, operation: &'static str) -> GfsError {
        GfsError::Unsupported {
            backend: self.id(),
            operation,
        }
    }
}

/// Shared state handed to backend factories
#[derive(Clone)]
pub struct FsContext {
    pub config: Arc<Config>,
    pub cache: Arc<CacheInterface>,
}

impl FsContext {
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(CacheInterface::from_config(&config.cache));
        Self {
            config: Arc::new(config),
            cache,
        }
    }

    /// Context sharing `config` but caching into `cache`
    pub fn with_cache(config: Config, cache: CacheInterface) -> Self {
        Self {
            config: Arc::new(config),
            cache: Arc::new(cache),
        }
    }
}

/// Builds a backend from the shared context
pub type FsFactory = fn(&FsContext) -> GfsResult<Arc<dyn FileSystem>>;

/// A backend and the protocol ids it serves
#[derive(Clone, Copy)]
pub struct FsDescriptor {
    pub ids: &'static [&'static str],
    pub factory: FsFactory,
}

impl std::fmt::Debug for FsDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsDescriptor").field("ids", &self.ids).finish()
    }
}

/// Backends compiled into gfs
pub fn builtin_file_systems() -> Vec<FsDescriptor> {
    vec![
        file_fs::FILE_SYSTEM,
        http_fs::FILE_SYSTEM,
        ftp_fs::FILE_SYSTEM,
        s3_fs::FILE_SYSTEM,
        gcs_fs::FILE_SYSTEM,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_prefers_tag_over_mtime() {
        let mut stat = FileStat::file("s3://b/k");
        stat.size = Some(3);
        stat.modified = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .ok()
            .map(|d| d.with_timezone(&Utc));
        assert_eq!(
            stat.seed().tag.as_deref(),
            Some("2024-01-02T03:04:05+00:00")
        );

        stat.tag = Some("\"abc\"".into());
        let seed = stat.seed();
        assert_eq!(seed.tag.as_deref(), Some("\"abc\""));
        assert_eq!(seed.size, Some(3));
    }

    #[test]
    fn builtin_protocols_are_unique() {
        let mut ids: Vec<_> = builtin_file_systems()
            .iter()
            .flat_map(|d| d.ids.iter().copied())
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        for id in ["file", "http", "https", "ftp", "s3", "gs", "gcs"] {
            assert!(ids.contains(&id), "missing {}", id);
        }
    }
}
