//! Local filesystem backend

use crate::cache::{BlockReader, BlockSpan, CacheInterface};
use crate::error::{GfsError, GfsResult};
use crate::fs::url::local_path;
use crate::fs::{
    DirEntry, FileKind, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode,
};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const FILE_SYSTEM: FsDescriptor = FsDescriptor {
    ids: &["file"],
    factory: LocalFs::factory,
};

/// Plain local paths and `file://` URLs
#[derive(Clone)]
pub struct LocalFs {
    cache: Arc<CacheInterface>,
    use_cache: bool,
}

impl LocalFs {
    pub fn new(cache: Arc<CacheInterface>, use_cache: bool) -> Self {
        Self { cache, use_cache }
    }

    fn factory(ctx: &FsContext) -> GfsResult<Arc<dyn FileSystem>> {
        Ok(Arc::new(Self::new(ctx.cache.clone(), ctx.config.file.use_cache)))
    }

    fn path(url: &str) -> GfsResult<PathBuf> {
        let path = local_path(url);
        std::path::absolute(&path).map_err(|e| GfsError::from_io_at(&path, "resolving", e))
    }
}

impl FileSystem for LocalFs {
    fn id(&self) -> &'static str {
        "file"
    }

    fn norm_url(&self, url: &str) -> GfsResult<String> {
        Ok(Self::path(url)?.display().to_string())
    }

    fn stat(&self, url: &str) -> GfsResult<FileStat> {
        let path = Self::path(url)?;
        let meta = fs::metadata(&path).map_err(|e| GfsError::from_io_at(&path, "stat", e))?;
        let url = path.display().to_string();
        let mut stat = if meta.is_dir() {
            FileStat::directory(url)
        } else {
            FileStat::file(url)
        };
        if !meta.is_dir() {
            stat.size = Some(meta.len());
        }
        stat.modified = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(stat)
    }

    fn open(&self, url: &str, mode: OpenMode) -> GfsResult<GfsFile> {
        let path = Self::path(url)?;
        let file = match mode {
            OpenMode::Read if self.use_cache => {
                let stat = self.stat(url)?;
                let reader = Arc::new(LocalReader::new(&path));
                return self
                    .cache
                    .open(&stat.url, &stat.seed(), reader)
                    .map(GfsFile::Cached);
            }
            OpenMode::Read => File::open(&path),
            OpenMode::Write => File::create(&path),
            OpenMode::Append => File::options().create(true).append(true).open(&path),
        };
        file.map(GfsFile::Local)
            .map_err(|e| GfsError::from_io_at(&path, "opening", e))
    }

    fn remove(&self, url: &str) -> GfsResult<()> {
        let path = Self::path(url)?;
        fs::remove_file(&path).map_err(|e| GfsError::from_io_at(&path, "removing", e))
    }

    fn rename(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (src, dst) = (Self::path(src)?, Self::path(dst)?);
        fs::rename(&src, &dst).map_err(|e| GfsError::from_io_at(&src, "renaming", e))
    }

    fn mkdir(&self, url: &str) -> GfsResult<()> {
        let path = Self::path(url)?;
        fs::create_dir(&path).map_err(|e| GfsError::from_io_at(&path, "creating", e))
    }

    fn makedirs(&self, url: &str, exist_ok: bool) -> GfsResult<()> {
        let path = Self::path(url)?;
        if !exist_ok && path.exists() {
            return Err(GfsError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(&path).map_err(|e| GfsError::from_io_at(&path, "creating", e))
    }

    fn rmdir(&self, url: &str) -> GfsResult<()> {
        let path = Self::path(url)?;
        fs::remove_dir(&path).map_err(|e| {
            if path.is_dir() && fs::read_dir(&path).is_ok_and(|mut d| d.next().is_some()) {
                GfsError::DirectoryNotEmpty(path.display().to_string())
            } else {
                GfsError::from_io_at(&path, "removing", e)
            }
        })
    }

    fn rmtree(&self, url: &str, ignore_errors: bool) -> GfsResult<()> {
        let path = Self::path(url)?;
        match fs::remove_dir_all(&path) {
            Err(e) if !ignore_errors => Err(GfsError::from_io_at(&path, "removing", e)),
            _ => Ok(()),
        }
    }

    fn list(&self, url: &str) -> GfsResult<Vec<DirEntry>> {
        let path = Self::path(url)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| GfsError::from_io_at(&path, "listing", e))? {
            let entry = entry.map_err(|e| GfsError::io(format!("listing {}", path.display()), e))?;
            let meta = entry.metadata().ok();
            let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                url: entry.path().display().to_string(),
                kind: if is_dir {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                size: meta.filter(|m| !m.is_dir()).map(|m| m.len()),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()> {
        let path = Self::path(url)?;
        fs::copy(local, &path).map_err(|e| GfsError::from_io_at(local, "copying", e))?;
        Ok(())
    }

    fn get_file(&self, url: &str, local: &Path) -> GfsResult<()> {
        let path = Self::path(url)?;
        fs::copy(&path, local).map_err(|e| GfsError::from_io_at(&path, "copying", e))?;
        Ok(())
    }

    fn as_local(&self, url: &str) -> GfsResult<PathBuf> {
        let stat = self.stat(url)?;
        if !self.use_cache || stat.is_dir() {
            return Ok(PathBuf::from(stat.url));
        }
        let path = Self::path(url)?;
        self.cache
            .as_local(&stat.url, &stat.seed(), Arc::new(LocalReader::new(&path)))
    }
}

/// Serves byte ranges of a local file to the cache
pub struct LocalReader {
    path: PathBuf,
}

impl LocalReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl BlockReader for LocalReader {
    fn support_blocks(&self) -> bool {
        true
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        let mut source = File::open(&self.path)
            .map_err(|e| GfsError::from_io_at(&self.path, "opening", e))?;
        let mut target =
            File::create(dest).map_err(|e| GfsError::from_io_at(dest, "creating", e))?;

        let copied = match span {
            BlockSpan::Whole => io::copy(&mut source, &mut target),
            BlockSpan::Range { offset, size } => source
                .seek(SeekFrom::Start(offset))
                .and_then(|_| io::copy(&mut source.take(size), &mut target)),
        }
        .map_err(|e| GfsError::io(format!("reading {}", self.path.display()), e))?;

        debug!("Copied {} bytes from {}", copied, self.path.display());
        Ok(copied)
    }
}
