//! Protocol-agnostic filesystem operations
//!
//! [`Gfs`] routes every call to the backend registered for the path's
//! protocol. A process-wide instance can be installed once with [`init`]
//! and fetched with [`global`].

pub mod registry;

pub use registry::Registry;

use crate::cache::CacheInterface;
use crate::config::Config;
use crate::error::{GfsError, GfsResult};
use crate::fs::url::{basename, join_url, local_path, protocol_or_default, split_url};
use crate::fs::{DirEntry, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

static GLOBAL: OnceLock<Gfs> = OnceLock::new();

/// Install the process-wide instance. Fails if one is already installed.
pub fn init(gfs: Gfs) -> GfsResult<&'static Gfs> {
    GLOBAL.set(gfs).map_err(|_| GfsError::AlreadyInitialized)?;
    GLOBAL.get().ok_or(GfsError::NotInitialized)
}

/// The process-wide instance installed by [`init`]
pub fn global() -> GfsResult<&'static Gfs> {
    GLOBAL.get().ok_or(GfsError::NotInitialized)
}

/// Entry point for filesystem operations on any supported protocol
pub struct Gfs {
    registry: Registry,
}

impl Gfs {
    /// Instance with every built-in backend, caching per `config`
    pub fn new(config: Config) -> Self {
        Self::with_context(FsContext::new(config))
    }

    /// Instance caching into an explicit cache
    pub fn with_cache(config: Config, cache: CacheInterface) -> Self {
        Self::with_context(FsContext::with_cache(config, cache))
    }

    pub fn with_context(ctx: FsContext) -> Self {
        Self {
            registry: Registry::with_builtins(ctx),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.registry.context().config
    }

    pub fn cache(&self) -> &Arc<CacheInterface> {
        &self.registry.context().cache
    }

    /// Add or replace a backend
    pub fn register_fs(&self, descriptor: FsDescriptor) {
        self.registry.register_fs(descriptor);
    }

    /// Backend for `path` and the path normalized by it
    pub fn resolve_fs(&self, path: &str) -> GfsResult<(Arc<dyn FileSystem>, String)> {
        self.registry.resolve_fs(path)
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> GfsResult<GfsFile> {
        let (fs, path) = self.resolve_fs(path)?;
        debug!("open {} ({:?})", path, mode);
        fs.open(&path, mode)
    }

    pub fn stat(&self, path: &str) -> GfsResult<FileStat> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.stat(&path)
    }

    pub fn exists(&self, path: &str) -> GfsResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn isdir(&self, path: &str) -> GfsResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(stat.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn isfile(&self, path: &str) -> GfsResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(!stat.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list(&self, path: &str) -> GfsResult<Vec<DirEntry>> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.list(&path)
    }

    pub fn remove(&self, path: &str) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        info!("Removing {}", path);
        fs.remove(&path)
    }

    /// Rename on one backend; paths on different protocols are rejected
    pub fn rename(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (src_proto, dst_proto) = (protocol_or_default(src), protocol_or_default(dst));
        if src_proto != dst_proto {
            return Err(GfsError::InvalidUrl {
                url: dst.to_string(),
                reason: format!("cannot rename across {} and {}", src_proto, dst_proto),
            });
        }
        let (fs, src_path) = self.resolve_fs(src)?;
        let dst_path = fs.norm_url(dst)?;
        fs.rename(&src_path, &dst_path)
    }

    /// Move `src` to `dst`: rename when both live on the same filesystem,
    /// copy and remove otherwise
    pub fn replace(&self, src: &str, dst: &str) -> GfsResult<()> {
        if self.is_same_fs(src, dst)? {
            match self.rename(src, dst) {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Rename of {} failed ({}), copying instead", src, e),
            }
        }
        self.copy(src, dst)?;
        self.remove(src)
    }

    /// Copy a file. When `dst` is an existing directory the file keeps its
    /// name inside it.
    pub fn copy(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (src_fs, src_path) = self.resolve_fs(src)?;
        let dst = if self.isdir(dst)? {
            join_url(dst, basename(&src_path))
        } else {
            dst.to_string()
        };
        let (dst_fs, dst_path) = self.resolve_fs(&dst)?;
        info!("Copying {} to {}", src_path, dst_path);

        match (src_fs.id(), dst_fs.id()) {
            ("file", "file") => {
                std::fs::copy(local_path(&src_path), local_path(&dst_path))
                    .map_err(|e| GfsError::from_io_at(&src_path, "copying", e))?;
                Ok(())
            }
            ("file", _) => dst_fs.put_file(&local_path(&src_path), &dst_path),
            (_, "file") => src_fs.get_file(&src_path, &local_path(&dst_path)),
            _ => {
                let staging = tempfile::NamedTempFile::new()
                    .map_err(|e| GfsError::io("creating copy staging file", e))?;
                src_fs.get_file(&src_path, staging.path())?;
                dst_fs.put_file(staging.path(), &dst_path)
            }
        }
    }

    pub fn mkdir(&self, path: &str) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.mkdir(&path)
    }

    pub fn makedirs(&self, path: &str, exist_ok: bool) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.makedirs(&path, exist_ok)
    }

    pub fn rmdir(&self, path: &str) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.rmdir(&path)
    }

    pub fn rmtree(&self, path: &str, ignore_errors: bool) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        info!("Removing tree {}", path);
        fs.rmtree(&path, ignore_errors)
    }

    /// Upload a local file to `path`
    pub fn put_file(&self, local: &Path, path: &str) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.put_file(local, &path)
    }

    /// Download `path` into a local file
    pub fn get_file(&self, path: &str, local: &Path) -> GfsResult<()> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.get_file(&path, local)
    }

    /// Local path holding the content of `path`, fetching it into the cache
    /// when remote
    pub fn as_local(&self, path: &str) -> GfsResult<PathBuf> {
        let (fs, path) = self.resolve_fs(path)?;
        fs.as_local(&path)
    }

    /// Whether a rename from `a` to `b` can stay on one filesystem.
    ///
    /// Remote URLs compare protocol and netloc; local paths compare the
    /// device of their nearest existing ancestor.
    pub fn is_same_fs(&self, a: &str, b: &str) -> GfsResult<bool> {
        let (proto_a, proto_b) = (protocol_or_default(a), protocol_or_default(b));
        if proto_a != proto_b {
            return Ok(false);
        }
        if proto_a == "file" {
            let (fs, a) = self.resolve_fs(a)?;
            let b = fs.norm_url(b)?;
            return Ok(device_of(Path::new(&a))? == device_of(Path::new(&b))?);
        }
        Ok(split_url(a)?.netloc == split_url(b)?.netloc)
    }
}

/// Device id of `path` or of its nearest existing ancestor
#[cfg(unix)]
fn device_of(path: &Path) -> GfsResult<u64> {
    use std::os::unix::fs::MetadataExt;

    let mut current = Some(path);
    while let Some(candidate) = current {
        if let Ok(meta) = std::fs::metadata(candidate) {
            return Ok(meta.dev());
        }
        current = candidate.parent();
    }
    Err(GfsError::NotFound(path.display().to_string()))
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> GfsResult<u64> {
    Ok(0)
}
