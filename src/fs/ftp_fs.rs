//! FTP backend
//!
//! Control connections are pooled per netloc. Block reads open a fresh
//! connection, `REST` to the block offset and stop reading once the block
//! is complete.

use crate::cache::{BlockReader, BlockSpan, CacheInterface, ObjectCache};
use crate::config::schema::FtpConfig;
use crate::error::{GfsError, GfsResult};
use crate::fs::handle::open_upload;
use crate::fs::url::{as_dir, basename, split_netloc, split_url, UrlParts};
use crate::fs::{
    DirEntry, FileKind, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode,
};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::debug;

pub const FILE_SYSTEM: FsDescriptor = FsDescriptor {
    ids: &["ftp"],
    factory: FtpFs::factory,
};

const DEFAULT_PORT: u16 = 21;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl FtpEndpoint {
    /// Endpoint for `netloc`, falling back to configured credentials
    pub fn parse(netloc: &str, defaults: &FtpConfig) -> Self {
        let (user, password, host, port) = split_netloc(netloc);
        Self {
            host,
            port: port.unwrap_or(DEFAULT_PORT),
            user: user.unwrap_or_else(|| defaults.user.clone()),
            password: password.unwrap_or_else(|| defaults.password.clone()),
        }
    }

    fn connect(&self) -> GfsResult<FtpStream> {
        let address = format!("{}:{}", self.host, self.port);
        let mut stream = FtpStream::connect(&address).map_err(|e| ftp_error(&address, e))?;
        stream
            .login(&self.user, &self.password)
            .and_then(|()| stream.transfer_type(FileType::Binary))
            .map_err(|e| ftp_error(&address, e))?;
        debug!("Connected to ftp://{} as {}", address, self.user);
        Ok(stream)
    }
}

fn ftp_error(target: &str, e: FtpError) -> GfsError {
    match e {
        FtpError::UnexpectedResponse(ref response) if response.status == Status::FileUnavailable => {
            GfsError::NotFound(target.to_string())
        }
        other => GfsError::backend("ftp", format!("{}: {}", target, other)),
    }
}

/// Absolute server path of a URL
fn server_path(parts: &UrlParts) -> String {
    format!("/{}", parts.path.trim_end_matches('/'))
}

#[derive(Clone)]
pub struct FtpFs {
    config: FtpConfig,
    pool: Arc<ObjectCache<String, Mutex<FtpStream>>>,
    cache: Arc<CacheInterface>,
}

impl FtpFs {
    pub fn new(config: FtpConfig, connection_max_age: Duration, cache: Arc<CacheInterface>) -> Self {
        Self {
            config,
            pool: Arc::new(ObjectCache::new(connection_max_age)),
            cache,
        }
    }

    fn factory(ctx: &FsContext) -> GfsResult<Arc<dyn FileSystem>> {
        Ok(Arc::new(Self::new(
            ctx.config.ftp.clone(),
            Duration::from_secs(ctx.config.connections.max_age_secs),
            ctx.cache.clone(),
        )))
    }

    fn locate(&self, url: &str) -> GfsResult<(UrlParts, FtpEndpoint, String)> {
        let parts = split_url(url)?;
        let endpoint = FtpEndpoint::parse(&parts.netloc, &self.config);
        let path = server_path(&parts);
        Ok((parts, endpoint, path))
    }

    /// Run `op` on the pooled control connection for `endpoint`.
    ///
    /// A connection that fails at the transport level is dropped from the
    /// pool so the next call reconnects.
    fn with_conn<T>(
        &self,
        endpoint: &FtpEndpoint,
        target: &str,
        op: impl FnOnce(&mut FtpStream) -> Result<T, FtpError>,
    ) -> GfsResult<T> {
        let key = format!("{}@{}:{}", endpoint.user, endpoint.host, endpoint.port);
        let conn = self
            .pool
            .get_or_try_insert_with(&key, || endpoint.connect().map(Mutex::new))?;
        let mut stream = conn.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut stream).map_err(|e| {
            if matches!(e, FtpError::ConnectionError(_)) {
                self.pool.invalidate(&key);
            }
            ftp_error(target, e)
        })
    }

    fn reader(&self, endpoint: FtpEndpoint, path: String) -> Arc<FtpReader> {
        Arc::new(FtpReader { endpoint, path })
    }
}

impl FileSystem for FtpFs {
    fn id(&self) -> &'static str {
        "ftp"
    }

    fn norm_url(&self, url: &str) -> GfsResult<String> {
        let parts = split_url(url)?;
        Ok(format!("ftp://{}/{}", parts.netloc, parts.path))
    }

    fn stat(&self, url: &str) -> GfsResult<FileStat> {
        let (_, endpoint, path) = self.locate(url)?;
        let probe = self.with_conn(&endpoint, url, |ftp| {
            match ftp.size(&path) {
                Ok(size) => {
                    let modified = ftp.mdtm(&path).ok();
                    Ok(Some((size as u64, modified)))
                }
                // SIZE fails on directories; CWD tells them apart from missing paths
                Err(FtpError::UnexpectedResponse(_)) => ftp.cwd(&path).map(|()| None),
                Err(e) => Err(e),
            }
        })?;

        Ok(match probe {
            Some((size, modified)) => {
                let mut stat = FileStat::file(url);
                stat.size = Some(size);
                stat.modified = modified.map(|m| m.and_utc());
                stat
            }
            None => FileStat::directory(url),
        })
    }

    fn open(&self, url: &str, mode: OpenMode) -> GfsResult<GfsFile> {
        match mode {
            OpenMode::Read => {
                let stat = self.stat(url)?;
                let (_, endpoint, path) = self.locate(url)?;
                self.cache
                    .open(url, &stat.seed(), self.reader(endpoint, path))
                    .map(GfsFile::Cached)
            }
            OpenMode::Write | OpenMode::Append => open_upload(self, url, mode),
        }
    }

    fn remove(&self, url: &str) -> GfsResult<()> {
        let (_, endpoint, path) = self.locate(url)?;
        self.with_conn(&endpoint, url, |ftp| ftp.rm(&path))
    }

    fn rename(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (_, endpoint, from) = self.locate(src)?;
        let (_, dst_endpoint, to) = self.locate(dst)?;
        if dst_endpoint.host != endpoint.host || dst_endpoint.port != endpoint.port {
            return Err(GfsError::InvalidUrl {
                url: dst.to_string(),
                reason: "rename target is on another server".to_string(),
            });
        }
        self.with_conn(&endpoint, src, |ftp| ftp.rename(&from, &to))
    }

    fn mkdir(&self, url: &str) -> GfsResult<()> {
        let (_, endpoint, path) = self.locate(url)?;
        self.with_conn(&endpoint, url, |ftp| ftp.mkdir(&path))
    }

    fn makedirs(&self, url: &str, exist_ok: bool) -> GfsResult<()> {
        let (_, endpoint, path) = self.locate(url)?;
        let exists = self
            .with_conn(&endpoint, url, |ftp| ftp.cwd(&path))
            .is_ok();
        if exists {
            return if exist_ok {
                Ok(())
            } else {
                Err(GfsError::AlreadyExists(url.to_string()))
            };
        }

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = format!("{}/{}", current, segment);
            let dir = current.clone();
            self.with_conn(&endpoint, url, |ftp| {
                if ftp.cwd(&dir).is_ok() {
                    Ok(())
                } else {
                    ftp.mkdir(&dir)
                }
            })?;
        }
        Ok(())
    }

    fn rmdir(&self, url: &str) -> GfsResult<()> {
        let (_, endpoint, path) = self.locate(url)?;
        self.with_conn(&endpoint, url, |ftp| ftp.rmdir(&path))
    }

    fn list(&self, url: &str) -> GfsResult<Vec<DirEntry>> {
        let (parts, endpoint, path) = self.locate(url)?;
        let base = format!("ftp://{}/{}", parts.netloc, as_dir(&parts.path));
        let mut entries = self.with_conn(&endpoint, url, |ftp| {
            let names = ftp.nlst(Some(path.as_str()))?;
            let mut entries = Vec::with_capacity(names.len());
            for name in names {
                let name = basename(&name).to_string();
                if name.is_empty() || name == "." || name == ".." {
                    continue;
                }
                let child = format!("{}/{}", path.trim_end_matches('/'), name);
                let size = ftp.size(&child).ok().map(|s| s as u64);
                entries.push(DirEntry {
                    url: format!("{}{}", base, name),
                    name,
                    kind: if size.is_some() {
                        FileKind::File
                    } else {
                        FileKind::Directory
                    },
                    size,
                });
            }
            Ok(entries)
        })?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()> {
        let (_, endpoint, path) = self.locate(url)?;
        let mut file = File::open(local).map_err(|e| GfsError::from_io_at(local, "opening", e))?;
        let written = self.with_conn(&endpoint, url, |ftp| ftp.put_file(&path, &mut file))?;
        debug!("STOR {} bytes to {}", written, url);
        Ok(())
    }

    fn as_local(&self, url: &str) -> GfsResult<PathBuf> {
        let stat = self.stat(url)?;
        let (_, endpoint, path) = self.locate(url)?;
        self.cache
            .as_local(url, &stat.seed(), self.reader(endpoint, path))
    }
}

/// Fetches bytes of one remote file on a dedicated connection
pub struct FtpReader {
    endpoint: FtpEndpoint,
    path: String,
}

impl BlockReader for FtpReader {
    fn support_blocks(&self) -> bool {
        true
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        let mut target = File::create(dest).map_err(|e| GfsError::from_io_at(dest, "creating", e))?;
        let mut ftp = self.endpoint.connect()?;
        let fail = |e| ftp_error(&self.path, e);

        match span {
            BlockSpan::Whole => {
                let mut stream = ftp.retr_as_stream(&self.path).map_err(fail)?;
                let copied = io::copy(&mut stream, &mut target)
                    .map_err(|e| GfsError::io(format!("downloading {}", self.path), e))?;
                ftp.finalize_retr_stream(stream).map_err(fail)?;
                Ok(copied)
            }
            BlockSpan::Range { offset, size } => {
                ftp.resume_transfer(offset as usize).map_err(fail)?;
                let stream = ftp.retr_as_stream(&self.path).map_err(fail)?;
                // the rest of the transfer is abandoned with the connection
                io::copy(&mut stream.take(size), &mut target)
                    .map_err(|e| GfsError::io(format!("downloading {}", self.path), e))
            }
        }
    }
}
