//! HTTP(S) backend
//!
//! Reads go through the cache; block fetches use `Range` requests when the
//! server advertises `Accept-Ranges: bytes`.

use crate::cache::{BlockReader, BlockSpan, CacheInterface};
use crate::config::schema::HttpConfig;
use crate::error::{GfsError, GfsResult};
use crate::fs::handle::open_upload;
use crate::fs::url::split_url;
use crate::fs::{DirEntry, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use ureq::http::{HeaderMap, Response};
use ureq::{Agent, Body, SendBody};

pub const FILE_SYSTEM: FsDescriptor = FsDescriptor {
    ids: &["http", "https"],
    factory: HttpFs::factory,
};

/// Build an agent that reports HTTP errors as responses
pub(crate) fn build_agent(config: &HttpConfig) -> Agent {
    let config = Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
        .http_status_as_error(false)
        .build();
    Agent::new_with_config(config)
}

/// Turn 404 into [`GfsError::NotFound`] and other failures into
/// [`GfsError::HttpStatus`]
pub(crate) fn check_status(url: &str, response: Response<Body>) -> GfsResult<Response<Body>> {
    match response.status().as_u16() {
        404 => Err(GfsError::NotFound(url.to_string())),
        status if status >= 400 => Err(GfsError::HttpStatus {
            url: url.to_string(),
            status,
        }),
        _ => Ok(response),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Stat information and range support from response headers
fn stat_from_headers(url: &str, headers: &HeaderMap) -> (FileStat, bool) {
    let mut stat = FileStat::file(url);
    stat.size = header(headers, "content-length").and_then(|v| v.parse().ok());
    stat.modified = header(headers, "last-modified")
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|d| d.with_timezone(&Utc));
    stat.tag = header(headers, "etag").map(str::to_string);
    let ranges = header(headers, "accept-ranges").is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
    (stat, ranges)
}

#[derive(Clone)]
pub struct HttpFs {
    agent: Agent,
    user_agent: String,
    cache: Arc<CacheInterface>,
}

impl HttpFs {
    pub fn new(config: &HttpConfig, cache: Arc<CacheInterface>) -> Self {
        Self {
            agent: build_agent(config),
            user_agent: config.user_agent.clone(),
            cache,
        }
    }

    fn factory(ctx: &FsContext) -> GfsResult<Arc<dyn FileSystem>> {
        Ok(Arc::new(Self::new(&ctx.config.http, ctx.cache.clone())))
    }

    fn head(&self, url: &str) -> GfsResult<(FileStat, bool)> {
        let response = self
            .agent
            .head(url)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| GfsError::backend("http", e))?;
        let response = check_status(url, response)?;
        Ok(stat_from_headers(url, response.headers()))
    }

    fn reader(&self, url: &str, ranges: bool) -> Arc<HttpReader> {
        Arc::new(HttpReader {
            agent: self.agent.clone(),
            user_agent: self.user_agent.clone(),
            url: url.to_string(),
            ranges,
        })
    }
}

impl FileSystem for HttpFs {
    fn id(&self) -> &'static str {
        "http"
    }

    fn norm_url(&self, url: &str) -> GfsResult<String> {
        let parts = split_url(url)?;
        Ok(format!("{}://{}/{}", parts.protocol, parts.netloc, parts.path))
    }

    fn stat(&self, url: &str) -> GfsResult<FileStat> {
        self.head(url).map(|(stat, _)| stat)
    }

    fn open(&self, url: &str, mode: OpenMode) -> GfsResult<GfsFile> {
        match mode {
            OpenMode::Read => {
                let (stat, ranges) = self.head(url)?;
                self.cache
                    .open(url, &stat.seed(), self.reader(url, ranges))
                    .map(GfsFile::Cached)
            }
            OpenMode::Write | OpenMode::Append => open_upload(self, url, mode),
        }
    }

    fn remove(&self, url: &str) -> GfsResult<()> {
        let response = self
            .agent
            .delete(url)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| GfsError::backend("http", e))?;
        check_status(url, response)?;
        Ok(())
    }

    fn rename(&self, _src: &str, _dst: &str) -> GfsResult<()> {
        Err(self.unsupported("rename"))
    }

    fn mkdir(&self, _url: &str) -> GfsResult<()> {
        Err(self.unsupported("mkdir"))
    }

    /// Servers create paths on upload
    fn makedirs(&self, _url: &str, _exist_ok: bool) -> GfsResult<()> {
        Ok(())
    }

    fn rmdir(&self, _url: &str) -> GfsResult<()> {
        Err(self.unsupported("rmdir"))
    }

    fn rmtree(&self, _url: &str, _ignore_errors: bool) -> GfsResult<()> {
        Err(self.unsupported("rmtree"))
    }

    fn list(&self, _url: &str) -> GfsResult<Vec<DirEntry>> {
        Err(self.unsupported("list"))
    }

    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()> {
        let mut file = File::open(local).map_err(|e| GfsError::from_io_at(local, "opening", e))?;
        let len = file
            .metadata()
            .map_err(|e| GfsError::from_io_at(local, "stat", e))?
            .len();
        let response = self
            .agent
            .put(url)
            .header("User-Agent", &self.user_agent)
            .header("Content-Length", len.to_string())
            .send(SendBody::from_reader(&mut file))
            .map_err(|e| GfsError::backend("http", e))?;
        check_status(url, response)?;
        debug!("PUT {} bytes to {}", len, url);
        Ok(())
    }

    fn as_local(&self, url: &str) -> GfsResult<PathBuf> {
        let (stat, ranges) = self.head(url)?;
        self.cache
            .as_local(url, &stat.seed(), self.reader(url, ranges))
    }
}

/// Fetches bytes of one URL for the cache
pub struct HttpReader {
    agent: Agent,
    user_agent: String,
    url: String,
    ranges: bool,
}

impl BlockReader for HttpReader {
    fn support_blocks(&self) -> bool {
        self.ranges
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        let mut request = self
            .agent
            .get(&self.url)
            .header("User-Agent", &self.user_agent);
        if let BlockSpan::Range { offset, size } = span {
            if size == 0 {
                File::create(dest).map_err(|e| GfsError::from_io_at(dest, "creating", e))?;
                return Ok(0);
            }
            request = request.header("Range", format!("bytes={}-{}", offset, offset + size - 1));
        }

        let response = request.call().map_err(|e| GfsError::backend("http", e))?;
        let status = response.status().as_u16();
        let mut target = File::create(dest).map_err(|e| GfsError::from_io_at(dest, "creating", e))?;
        if status == 416 {
            return Ok(0);
        }
        let response = check_status(&self.url, response)?;
        let mut body = response.into_body().into_reader();

        let copied = match span {
            BlockSpan::Range { offset, size } => {
                if status == 200 {
                    debug!("{} ignored the range request, skipping {} bytes", self.url, offset);
                    let mut skipped = (&mut body).take(offset);
                    io::copy(&mut skipped, &mut io::sink())
                        .map_err(|e| GfsError::io(format!("downloading {}", self.url), e))?;
                }
                io::copy(&mut body.take(size), &mut target)
            }
            BlockSpan::Whole => io::copy(&mut body, &mut target),
        };
        copied.map_err(|e| GfsError::io(format!("downloading {}", self.url), e))
    }
}
