//! Amazon S3 backend
//!
//! The SDK is async; calls run on a small private runtime so the rest of
//! gfs stays synchronous. Directories are key prefixes ending in `/`.

use crate::cache::{BlockReader, BlockSpan, CacheInterface};
use crate::config::schema::S3Config;
use crate::error::{GfsError, GfsResult};
use crate::fs::handle::open_upload;
use crate::fs::url::{as_dir, split_url};
use crate::fs::{
    DirEntry, FileKind, FileStat, FileSystem, FsContext, FsDescriptor, GfsFile, OpenMode,
};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

pub const FILE_SYSTEM: FsDescriptor = FsDescriptor {
    ids: &["s3"],
    factory: S3Fs::factory,
};

fn s3_error<E>(url: &str, e: SdkError<E, HttpResponse>) -> GfsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = e.raw_response().map(|r| r.status().as_u16());
    let missing = status == Some(404)
        || matches!(e.code(), Some("NoSuchKey" | "NotFound" | "NoSuchBucket"));
    if missing {
        GfsError::NotFound(url.to_string())
    } else {
        GfsError::backend("s3", format!("{}: {}", url, DisplayErrorContext(&e)))
    }
}

fn to_chrono(time: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

/// Bucket and key of an `s3://` URL
fn bucket_key(url: &str) -> GfsResult<(String, String)> {
    let parts = split_url(url)?;
    if parts.netloc.is_empty() {
        return Err(GfsError::InvalidUrl {
            url: url.to_string(),
            reason: "missing bucket".to_string(),
        });
    }
    Ok((parts.netloc, parts.path))
}

/// Name of `key` relative to `prefix`, without a trailing slash
fn relative_name(prefix: &str, key: &str) -> Option<String> {
    let name = key.strip_prefix(prefix)?.trim_end_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

fn range_header(offset: u64, size: u64) -> String {
    format!("bytes={}-{}", offset, offset + size - 1)
}

#[derive(Clone)]
pub struct S3Fs {
    client: Client,
    runtime: Arc<Runtime>,
    cache: Arc<CacheInterface>,
}

impl S3Fs {
    pub fn new(config: &S3Config, cache: Arc<CacheInterface>) -> GfsResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gfs-s3")
            .enable_all()
            .build()
            .map_err(|e| GfsError::io("starting S3 runtime", e))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = runtime.block_on(loader.load());
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        debug!(
            "S3 client ready (region: {:?}, endpoint: {:?})",
            shared.region(),
            config.endpoint
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            runtime: Arc::new(runtime),
            cache,
        })
    }

    fn factory(ctx: &FsContext) -> GfsResult<Arc<dyn FileSystem>> {
        Ok(Arc::new(Self::new(&ctx.config.s3, ctx.cache.clone())?))
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn reader(&self, url: &str) -> GfsResult<Arc<S3Reader>> {
        let (bucket, key) = bucket_key(url)?;
        Ok(Arc::new(S3Reader {
            fs: self.clone(),
            url: url.to_string(),
            bucket,
            key,
        }))
    }

    /// Whether any object lives under the directory prefix `key/`
    fn prefix_exists(&self, url: &str, bucket: &str, key: &str) -> GfsResult<bool> {
        let output = self
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(as_dir(key))
                    .max_keys(1)
                    .send(),
            )
            .map_err(|e| s3_error(url, e))?;
        Ok(output.key_count().unwrap_or(0) > 0 || !output.contents().is_empty())
    }
}

impl FileSystem for S3Fs {
    fn id(&self) -> &'static str {
        "s3"
    }

    fn norm_url(&self, url: &str) -> GfsResult<String> {
        let (bucket, key) = bucket_key(url)?;
        Ok(format!("s3://{}/{}", bucket, key))
    }

    fn stat(&self, url: &str) -> GfsResult<FileStat> {
        let (bucket, key) = bucket_key(url)?;
        if key.is_empty() {
            self.block_on(self.client.head_bucket().bucket(&bucket).send())
                .map_err(|e| s3_error(url, e))?;
            return Ok(FileStat::directory(url));
        }

        if !key.ends_with('/') {
            match self.block_on(self.client.head_object().bucket(&bucket).key(&key).send()) {
                Ok(head) => {
                    let mut stat = FileStat::file(url);
                    stat.size = head.content_length().and_then(|l| u64::try_from(l).ok());
                    stat.modified = head.last_modified().and_then(to_chrono);
                    stat.tag = head.e_tag().map(str::to_string);
                    return Ok(stat);
                }
                Err(e) => match s3_error(url, e) {
                    GfsError::NotFound(_) => {}
                    other => return Err(other),
                },
            }
        }

        if self.prefix_exists(url, &bucket, &key)? {
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
        let (bucket, key) = bucket_key(url)?;
        self.block_on(self.client.delete_object().bucket(bucket).key(key).send())
            .map_err(|e| s3_error(url, e))?;
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> GfsResult<()> {
        let (src_bucket, src_key) = bucket_key(src)?;
        let (dst_bucket, dst_key) = bucket_key(dst)?;
        let source = format!("{}/{}", src_bucket, urlencoding::encode(&src_key));
        self.block_on(
            self.client
                .copy_object()
                .copy_source(source)
                .bucket(dst_bucket)
                .key(dst_key)
                .send(),
        )
        .map_err(|e| s3_error(src, e))?;
        self.remove(src)
    }

    /// Creates a zero-byte `dir/` marker object
    fn mkdir(&self, url: &str) -> GfsResult<()> {
        let (bucket, key) = bucket_key(url)?;
        self.block_on(
            self.client
                .put_object()
                .bucket(bucket)
                .key(as_dir(&key))
                .body(ByteStream::from_static(b""))
                .send(),
        )
        .map_err(|e| s3_error(url, e))?;
        Ok(())
    }

    fn makedirs(&self, url: &str, exist_ok: bool) -> GfsResult<()> {
        let (bucket, key) = bucket_key(url)?;
        if key.is_empty() || self.prefix_exists(url, &bucket, &key)? {
            return if exist_ok {
                Ok(())
            } else {
                Err(GfsError::AlreadyExists(url.to_string()))
            };
        }
        self.mkdir(url)
    }

    fn rmdir(&self, url: &str) -> GfsResult<()> {
        let (bucket, key) = bucket_key(url)?;
        let marker = as_dir(&key);
        let children = self.list(url)?;
        if !children.is_empty() {
            return Err(GfsError::DirectoryNotEmpty(url.to_string()));
        }
        self.block_on(self.client.delete_object().bucket(bucket).key(marker).send())
            .map_err(|e| s3_error(url, e))?;
        Ok(())
    }

    fn list(&self, url: &str) -> GfsResult<Vec<DirEntry>> {
        let (bucket, key) = bucket_key(url)?;
        let prefix = as_dir(&key);
        let base = format!("s3://{}/{}", bucket, prefix);
        let mut entries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .block_on(
                    self.client
                        .list_objects_v2()
                        .bucket(&bucket)
                        .prefix(&prefix)
                        .delimiter("/")
                        .set_continuation_token(token.take())
                        .send(),
                )
                .map_err(|e| s3_error(url, e))?;

            for common in output.common_prefixes() {
                if let Some(name) = common.prefix().and_then(|p| relative_name(&prefix, p)) {
                    entries.push(DirEntry {
                        url: format!("{}{}/", base, name),
                        name,
                        kind: FileKind::Directory,
                        size: None,
                    });
                }
            }
            for object in output.contents() {
                if let Some(name) = object.key().and_then(|k| relative_name(&prefix, k)) {
                    entries.push(DirEntry {
                        url: format!("{}{}", base, name),
                        name,
                        kind: FileKind::File,
                        size: object.size().and_then(|s| u64::try_from(s).ok()),
                    });
                }
            }

            match output.next_continuation_token() {
                Some(next) if output.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put_file(&self, local: &Path, url: &str) -> GfsResult<()> {
        let (bucket, key) = bucket_key(url)?;
        let body = self
            .block_on(ByteStream::from_path(local))
            .map_err(|e| GfsError::backend("s3", format!("reading {}: {}", local.display(), e)))?;
        self.block_on(
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send(),
        )
        .map_err(|e| s3_error(url, e))?;
        debug!("Uploaded {} to {}", local.display(), url);
        Ok(())
    }

    fn as_local(&self, url: &str) -> GfsResult<PathBuf> {
        let stat = self.stat(url)?;
        self.cache.as_local(url, &stat.seed(), self.reader(url)?)
    }
}

/// Fetches object ranges for the cache
pub struct S3Reader {
    fs: S3Fs,
    url: String,
    bucket: String,
    key: String,
}

impl BlockReader for S3Reader {
    fn support_blocks(&self) -> bool {
        true
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        let mut target = std::fs::File::create(dest)
            .map_err(|e| GfsError::from_io_at(dest, "creating", e))?;
        let mut request = self
            .fs
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key);
        if let BlockSpan::Range { offset, size } = span {
            if size == 0 {
                return Ok(0);
            }
            request = request.range(range_header(offset, size));
        }

        self.fs.block_on(async {
            let output = match request.send().await {
                Ok(output) => output,
                Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(416) => {
                    return Ok(0);
                }
                Err(e) => return Err(s3_error(&self.url, e)),
            };

            let mut body = output.body;
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    GfsError::backend("s3", format!("reading {}: {}", self.url, e))
                })?;
                target
                    .write_all(&chunk)
                    .map_err(|e| GfsError::io(format!("writing {}", dest.display()), e))?;
                written += chunk.len() as u64;
            }
            Ok(written)
        })
    }
}
