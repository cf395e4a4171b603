//! File handles returned by [`FileSystem::open`](crate::fs::FileSystem::open)

use crate::cache::CachedFile;
use crate::error::{GfsError, GfsResult};
use crate::fs::{FileSystem, OpenMode};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

type CommitFn = Box<dyn FnOnce(&Path) -> GfsResult<()> + Send>;

/// Local staging file uploaded to its destination on [`Upload::commit`]
pub struct Upload {
    url: String,
    tmp: NamedTempFile,
    commit: Option<CommitFn>,
}

impl Upload {
    pub fn new(
        url: impl Into<String>,
        commit: impl FnOnce(&Path) -> GfsResult<()> + Send + 'static,
    ) -> GfsResult<Self> {
        let tmp = NamedTempFile::new().map_err(|e| GfsError::io("creating upload staging file", e))?;
        Ok(Self {
            url: url.into(),
            tmp,
            commit: Some(Box::new(commit)),
        })
    }

    /// Destination URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path of the staging file
    pub fn staging_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Flush the staging file and upload it
    pub fn commit(mut self) -> GfsResult<()> {
        self.tmp
            .as_file_mut()
            .flush()
            .map_err(|e| GfsError::io(format!("flushing upload to {}", self.url), e))?;
        match self.commit.take() {
            Some(commit) => {
                commit(self.tmp.path())?;
                debug!("Uploaded {}", self.url);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Write for Upload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tmp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

impl Seek for Upload {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.tmp.seek(pos)
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if self.commit.is_some() {
            warn!("Discarding uncommitted upload to {}", self.url);
        }
    }
}

/// An open file on any backend
pub enum GfsFile {
    /// Local file opened directly
    Local(File),
    /// Remote content read through the block cache
    Cached(CachedFile),
    /// Remote write staged locally
    Upload(Upload),
}

impl GfsFile {
    /// Finish the file: sync local writes, upload staged writes
    pub fn commit(self) -> GfsResult<()> {
        match self {
            Self::Local(file) => file
                .sync_all()
                .or_else(|e| match e.kind() {
                    // read-only handles cannot be synced on every platform
                    io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => Ok(()),
                    _ => Err(e),
                })
                .map_err(|e| GfsError::io("syncing file", e)),
            Self::Cached(mut file) => {
                file.close();
                Ok(())
            }
            Self::Upload(upload) => upload.commit(),
        }
    }

    /// Whether the handle reads through the cache
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

impl Read for GfsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Local(file) => file.read(buf),
            Self::Cached(file) => file.read(buf),
            Self::Upload(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file is open for writing",
            )),
        }
    }
}

impl Write for GfsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Local(file) => file.write(buf),
            Self::Upload(upload) => upload.write(buf),
            Self::Cached(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file is open for reading",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Local(file) => file.flush(),
            Self::Upload(upload) => upload.flush(),
            Self::Cached(_) => Ok(()),
        }
    }
}

impl Seek for GfsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Local(file) => file.seek(pos),
            Self::Cached(file) => file.seek(pos),
            Self::Upload(upload) => upload.seek(pos),
        }
    }
}

impl std::fmt::Debug for GfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(file) => f.debug_tuple("Local").field(file).finish(),
            Self::Cached(file) => f.debug_tuple("Cached").field(file).finish(),
            Self::Upload(upload) => f.debug_tuple("Upload").field(&upload.url).finish(),
        }
    }
}

/// Stage a write to `url`, uploaded through `fs.put_file` on commit.
///
/// In append mode the current content is downloaded into the staging file
/// first; a missing file starts out empty.
pub(crate) fn open_upload<F>(fs: &F, url: &str, mode: OpenMode) -> GfsResult<GfsFile>
where
    F: FileSystem + Clone + 'static,
{
    let target = url.to_string();
    let backend = fs.clone();
    let mut upload = Upload::new(url, move |path| backend.put_file(path, &target))?;

    if mode == OpenMode::Append {
        match fs.get_file(url, upload.staging_path()) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        // get_file may have replaced the staging file
        let file = File::options()
            .append(true)
            .open(upload.staging_path())
            .map_err(|e| GfsError::io("reopening upload staging file", e))?;
        *upload.tmp.as_file_mut() = file;
        upload
            .seek(SeekFrom::End(0))
            .map_err(|e| GfsError::io("seeking upload staging file", e))?;
    }
    Ok(GfsFile::Upload(upload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn commit_hands_staged_bytes_to_uploader() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut upload = Upload::new("s3://b/k", move |path| {
            *sink.lock().unwrap() = std::fs::read(path).unwrap();
            Ok(())
        })
        .unwrap();

        upload.write_all(b"hello").unwrap();
        GfsFile::Upload(upload).commit().unwrap();
        assert_eq!(*received.lock().unwrap(), b"hello");
    }

    #[test]
    fn dropped_upload_is_not_sent() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        {
            let mut upload = Upload::new("s3://b/k", move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();
            upload.write_all(b"x").unwrap();
        }
        assert!(!*called.lock().unwrap());
    }

    #[test]
    fn reading_an_upload_fails() {
        let upload = Upload::new("s3://b/k", |_| Ok(())).unwrap();
        let mut file = GfsFile::Upload(upload);
        let mut buf = [0u8; 4];
        assert_eq!(
            file.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        file.commit().unwrap();
    }
}
