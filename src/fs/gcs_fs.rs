//! Google Cloud Storage backend over the JSON API

use crate::cache::{BlockReader, BlockSpan, CacheInterface, ObjectCache};
use crate::config::schema::{GcsConfig, HttpConfig};
use crate::error::{GfsError, GfsResult};
use crate::fs::handle::open_upload;
use crate::fs::http_fs::{build_agent, check_status};
use crate::fs::url::{as_dir, split_url};
use crate::fs::{
    DirEntry, FileKind, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ureq::http::Response;
use ureq::{Agent, Body, SendBody};

pub const FILE_SYSTEM: FsDescriptor = FsDescriptor {
    ids: &["gs", "gcs"],
    factory: GcsFs::factory,
};

/// Environment variable holding a ready-made access token
pub const ENV_TOKEN: &str = "GCS_OAUTH_TOKEN";

/// Access tokens live for an hour; refresh a little earlier
const TOKEN_MAX_AGE: Duration = Duration::from_secs(55 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectInfo {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    generation: Option<String>,
}

impl ObjectInfo {
    fn size(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }

    fn to_stat(&self, url: &str) -> FileStat {
        let mut stat = FileStat::file(url);
        stat.size = self.size();
        stat.modified = self
            .updated
            .as_deref()
            .and_then(|u| DateTime::parse_from_rfc3339(u).ok())
            .map(|d| d.with_timezone(&Utc));
        stat.tag = self.generation.clone();
        stat
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectInfo>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteStatus {
    done: bool,
    rewrite_token: Option<String>,
}

/// Resolves OAuth access tokens, caching them for most of their lifetime
pub struct TokenSource {
    configured: Option<String>,
    service_account: Option<String>,
    cached: ObjectCache<&'static str, String>,
}

impl TokenSource {
    pub fn new(config: &GcsConfig) -> Self {
        Self {
            configured: config.token.clone(),
            service_account: config.service_account.clone(),
            cached: ObjectCache::new(TOKEN_MAX_AGE),
        }
    }

    /// Token from configuration, `GCS_OAUTH_TOKEN`, or `gcloud`
    pub fn token(&self) -> GfsResult<Arc<String>> {
        self.cached.get_or_try_insert_with(&"token", || {
            if let Some(token) = self.configured.clone().filter(|t| !t.is_empty()) {
                return Ok(token);
            }
            if let Some(token) = std::env::var(ENV_TOKEN).ok().filter(|t| !t.is_empty()) {
                debug!("Using GCS token from {}", ENV_TOKEN);
                return Ok(token);
            }
            self.from_gcloud()
        })
    }

    /// Forget the cached token after the server rejected it
    pub fn invalidate(&self) {
        self.cached.invalidate(&"token");
    }

    fn from_gcloud(&self) -> GfsResult<String> {
        info!("Requesting GCS access token from gcloud...");

        let mut cmd = Command::new("gcloud");
        cmd.args(["auth", "print-access-token"]);
        if let Some(account) = &self.service_account {
            cmd.args(["--impersonate-service-account", account]);
        }
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| GfsError::command_failed("gcloud auth print-access-token", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not logged in") || stderr.contains("no active account") {
                return Err(GfsError::GcsNotAuthenticated);
            }
            return Err(GfsError::backend("gcs", stderr.trim()));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(GfsError::backend("gcs", "gcloud returned an empty token"));
        }
        Ok(token)
    }
}

#[derive(Clone)]
pub struct GcsFs {
    agent: Agent,
    user_agent: String,
    endpoint: String,
    tokens: Arc<TokenSource>,
    cache: Arc<CacheInterface>,
}

impl GcsFs {
    pub fn new(config: &GcsConfig, http: &HttpConfig, cache: Arc<CacheInterface>) -> Self {
        Self {
            agent: build_agent(http),
            user_agent: http.user_agent.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tokens: Arc::new(TokenSource::new(config)),
            cache,
        }
    }

    fn factory(ctx: &FsContext) -> GfsResult<Arc<dyn FileSystem>> {
        Ok(Arc::new(Self::new(
            &ctx.config.gcs,
            &ctx.config.http,
            ctx.cache.clone(),
        )))
    }

    fn object_api(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(bucket),
            urlencoding::encode(object)
        )
    }

    fn bucket_api(&self, bucket: &str) -> String {
        format!("{}/storage/v1/b/{}", self.endpoint, urlencoding::encode(bucket))
    }

    fn auth(&self) -> GfsResult<String> {
        Ok(format!("Bearer {}", self.tokens.token()?))
    }

    /// Check a response, dropping the cached token on 401
    fn checked(&self, url: &str, response: Response<Body>) -> GfsResult<Response<Body>> {
        if response.status().as_u16() == 401 {
            self.tokens.invalidate();
            return Err(GfsError::GcsNotAuthenticated);
        }
        check_status(url, response)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, api: &str) -> GfsResult<T> {
        let response = self
            .agent
            .get(api)
            .header("Authorization", self.auth()?)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| GfsError::backend("gcs", e))?;
        let response = self.checked(url, response)?;
        Ok(serde_json::from_reader(response.into_body().into_reader())?)
    }

    fn delete(&self, url: &str, api: &str) -> GfsResult<()> {
        let response = self
            .agent
            .delete(api)
            .header("Authorization", self.auth()?)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| GfsError::backend("gcs", e))?;
        self.checked(url, response)?;
        Ok(())
    }

    fn list_page(
        &self,
        url: &str,
        bucket: &str,
        prefix: &str,
        page: Option<&str>,
    ) -> GfsResult<ObjectList> {
        let mut api = format!(
            "{}/o?delimiter=%2F&prefix={}",
            self.bucket_api(bucket),
            urlencoding::encode(prefix)
        );
        if let Some(page) = page {
            api.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }
        self.get_json(url, &api)
    }

    fn prefix_exists(&self, url: &str, bucket: &str, object: &str) -> GfsResult<bool> {
        let listing = self.list_page(url, bucket, &as_dir(object), None)?;
        Ok(!listing.items.is_empty() || !listing.prefixes.is_empty())
    }

    fn reader(&self, url: &str) -> GfsResult<Arc<GcsReader>> {
        let (bucket, object) = bucket_object(url)?;
        Ok(Arc::new(GcsReader {
            fs: self.clone(),
            url: url.to_string(),
            api: format!("{}?alt=media", self.object_api(&bucket, &object)),
        }))
    }
}

/// Bucket and object name of a `gs://` URL
fn bucket_object(url: &str) -> GfsResult<(String, String)> {
    let parts = split_url(url)?;
    if parts.netloc.is_empty() {
        return Err(GfsError::InvalidUrl {
            url: url.to_string(),
            reason: "missing bucket".to_string(),
        });
    }
    Ok((parts.netloc, parts.path))
}

fn listing_entries(base: &str, prefix: &str, listing: ObjectList) -> Vec<DirEntry> {
    let relative = |key: &str| {
        key.strip_prefix(prefix)
            .map(|name| name.trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty())
    };

    let dirs = listing.prefixes.iter().filter_map(|p| {
        relative(p).map(|name| DirEntry {
            url: format!("{}{}/", base, name),
            name,
            kind: FileKind::Directory,
            size: None,
        })
    });
    let files = listing.items.iter().filter_map(|item| {
        relative(&item.name).map(|name| DirEntry {
            url: format!("{}{}", base, name),
            name,
            kind: FileKind::File,
            size: item.size(),
        })
    });
    dirs.chain(files).collect()
}

impl FileSystem for GcsFs {
    fn id(&self) -> &'static str {
        "gs"
    }

    fn norm_url(&self, url: &str) -> GfsResult<String> {
        let (bucket, object) = bucket_object(url)?;
        Ok(format!("gs://{}/{}", bucket, object))
    }

    fn stat(&self, url: &str) -> GfsResult<FileStat> {
        let (bucket, object) = bucket_object(url)?;
        if object.is_empty() {
            let _: serde_json::Value = self.get_json(url, &self.bucket_api(&bucket))?;
            return Ok(FileStat::directory(url));
        }

        if !object.ends_with('/') {
            match self.get_json::<ObjectInfo>(url, &self.object_api(&bucket, &object)) {
                Ok(info) => return Ok(info.to_stat(url)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if self.prefix_exists(url, &bucket, &object)? {
            Ok(FileStat::directory(url))
        } else {
            Err(GfsError::NotFound(url.to_string()))
        }
    }

    fn open(&self, url: &str, mode: OpenMode) -> GfsResult<GfsFile> {
        match mode {
            OpenMode::Read => {
                let stat = self.stat(url)?;
                if stat.is_dir() {
                    return Err(GfsError::InvalidUrl {
                        url: url.to_string(),
                        reason: "is a directory".to_string(),
                    });
                }
                self.cache
                    .open(url, &stat.seed(), self.reader(url)?)
                    .map(GfsFile::Cached)
            }
            OpenMode::Write | OpenMode::Append => open_upload(self, url, mode),
        }
    }

    fn remove(&self, url: &str) -> GfsResult<()> {
        let (bucket, object) = bucket_object(url)?;
        self.delete(url, &self.object_api(&bucket, &object))
    }

    fn rename(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (src_bucket, src_object) = bucket_object(src)?;
        let (dst_bucket, dst_object) = bucket_object(dst)?;
        let base = format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.object_api(&src_bucket, &src_object),
            urlencoding::encode(&dst_bucket),
            urlencoding::encode(&dst_object)
        );

        let mut token: Option<String> = None;
        loop {
            let api = match &token {
                Some(token) => format!("{}?rewriteToken={}", base, urlencoding::encode(token)),
                None => base.clone(),
            };
            let response = self
                .agent
                .post(&api)
                .header("Authorization", self.auth()?)
                .header("User-Agent", &self.user_agent)
                .send_empty()
                .map_err(|e| GfsError::backend("gcs", e))?;
            let response = self.checked(src, response)?;
            let status: RewriteStatus = serde_json::from_reader(response.into_body().into_reader())?;
            if status.done {
                break;
            }
            debug!("Rewrite of {} to {} still in progress", src, dst);
            token = status.rewrite_token;
        }
        self.remove(src)
    }

    /// Creates a zero-byte `dir/` placeholder object
    fn mkdir(&self, url: &str) -> GfsResult<()> {
        let (bucket, object) = bucket_object(url)?;
        let marker = tempfile::NamedTempFile::new()
            .map_err(|e| GfsError::io("creating placeholder file", e))?;
        self.put_file(marker.path(), &format!("gs://{}/{}", bucket, as_dir(&object)))
    }

    fn makedirs(&self, url: &str, exist_ok: bool) -> GfsResult<()> {
        let (bucket, object) = bucket_object(url)?;
        if object.is_empty() || self.prefix_exists(url, &bucket, &object)? {
            return if exist_ok {
                Ok(())
            } else {
                Err(GfsError::AlreadyExists(url.to_string()))
            };
        }
        self.mkdir(url)
    }

    fn rmdir(&self, url: &str) -> GfsResult<()> {
        let (bucket, object) = bucket_object(url)?;
        if !self.list(url)?.is_empty() {
            return Err(GfsError::DirectoryNotEmpty(url.to_string()));
        }
        match self.delete(url, &self.object_api(&bucket, &as_dir(&object))) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn list(&self, url: &str) -> GfsResult<Vec<DirEntry>> {
        let (bucket, object) = bucket_object(url)?;
        let prefix = as_dir(&object);
        let base = format!("gs://{}/{}", bucket, prefix);
        let mut entries = Vec::new();
        let mut page: Option<String> = None;

        loop {
            let mut listing = self.list_page(url, &bucket, &prefix, page.as_deref())?;
            page = listing.next_page_token.take();
            entries.extend(listing_entries(&base, &prefix, listing));
            if page.is_none() {
                break;
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()> {
        let (bucket, object) = bucket_object(url)?;
        let mut file = File::open(local).map_err(|e| GfsError::from_io_at(local, "opening", e))?;
        let len = file
            .metadata()
            .map_err(|e| GfsError::from_io_at(local, "stat", e))?
            .len();
        let api = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            urlencoding::encode(&bucket),
            urlencoding::encode(&object)
        );
        let response = self
            .agent
            .post(&api)
            .header("Authorization", self.auth()?)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len.to_string())
            .send(SendBody::from_reader(&mut file))
            .map_err(|e| GfsError::backend("gcs", e))?;
        self.checked(url, response)?;
        debug!("Uploaded {} bytes to {}", len, url);
        Ok(())
    }

    fn as_local(&self, url: &str) -> GfsResult<PathBuf> {
        let stat = self.stat(url)?;
        self.cache.as_local(url, &stat.seed(), self.reader(url)?)
    }
}

/// Fetches object media for the cache
pub struct GcsReader {
    fs: GcsFs,
    url: String,
    api: String,
}

impl BlockReader for GcsReader {
    fn support_blocks(&self) -> bool {
        true
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        let mut target = File::create(dest).map_err(|e| GfsError::from_io_at(dest, "creating", e))?;
        let mut request = self
            .fs
            .agent
            .get(&self.api)
            .header("Authorization", self.fs.auth()?)
            .header("User-Agent", &self.fs.user_agent);
        if let BlockSpan::Range { offset, size } = span {
            if size == 0 {
                return Ok(0);
            }
            request = request.header("Range", format!("bytes={}-{}", offset, offset + size - 1));
        }

        let response = request.call().map_err(|e| GfsError::backend("gcs", e))?;
        if response.status().as_u16() == 416 {
            return Ok(0);
        }
        let response = self.fs.checked(&self.url, response)?;
        let mut body = response.into_body().into_reader();
        let copied = match span {
            BlockSpan::Range { size, .. } => io::copy(&mut body.take(size), &mut target),
            BlockSpan::Whole => io::copy(&mut body, &mut target),
        };
        copied.map_err(|e| GfsError::io(format!("downloading {}", self.url), e))
    }
}
