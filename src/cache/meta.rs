//! Cache entry metadata and content identity

use crate::error::{GfsError, GfsResult};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

/// Name of the metadata file inside an entry directory
pub const META_FILE: &str = "META";

/// Number of hex characters kept from the identity hash
const CID_LEN: usize = 16;

/// Metadata persisted in an entry's `META` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Source URL
    pub url: String,
    /// Content length, once known
    pub size: Option<u64>,
    /// Size of a cached block
    pub block_size: u64,
    /// Content identity of the cached generation
    pub cid: String,
}

/// Identity information a backend knows about a resource before caching it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSeed {
    /// Content length, if the backend knows it
    pub size: Option<u64>,
    /// Block size override
    pub block_size: Option<u64>,
    /// Backend content tag (ETag, mtime, generation, ...)
    pub tag: Option<String>,
}

impl MetaSeed {
    /// Seed with no identity information
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the known content length
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Set the backend content tag
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    /// Override the block size
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }
}

/// Merge defaults with `seed` and compute the content identity.
///
/// Everything that changes what bytes a block file holds goes into the
/// `cid`: URL, block size, content length and the backend tag.
pub fn prepare_meta(url: &str, seed: &MetaSeed, default_block_size: u64) -> Meta {
    let block_size = seed
        .block_size
        .filter(|size| *size > 0)
        .unwrap_or(default_block_size)
        .max(1);

    let identity = format!(
        "url={}\nblock_size={}\nsize={}\ntag={}",
        url,
        block_size,
        seed.size.map(|s| s.to_string()).unwrap_or_default(),
        seed.tag.as_deref().unwrap_or_default(),
    );
    let mut cid = sha1_hex(identity.as_bytes());
    cid.truncate(CID_LEN);

    Meta {
        url: url.to_string(),
        size: seed.size,
        block_size,
        cid,
    }
}

/// Directory name of the cache entry for `url`
pub fn url_key(url: &str) -> String {
    sha1_hex(url.as_bytes())
}

/// Read `META` from an entry directory
pub fn load_meta(entry: &Path) -> GfsResult<Meta> {
    let path = entry.join(META_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|e| GfsError::io(format!("reading {}", path.display()), e))?;

    let meta: Meta = serde_yaml::from_str(&content).map_err(|e| GfsError::MetaInvalid {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    if meta.block_size == 0 {
        return Err(GfsError::MetaInvalid {
            path,
            reason: "block_size is zero".to_string(),
        });
    }
    Ok(meta)
}

/// Write `META` into an entry directory, replacing it atomically
pub fn save_meta(entry: &Path, meta: &Meta) -> GfsResult<()> {
    let path = entry.join(META_FILE);
    let tmp = entry.join(format!("{}.tmp-{}", META_FILE, std::process::id()));
    let content = serde_yaml::to_string(meta)?;

    fs::write(&tmp, content)
        .and_then(|()| fs::rename(&tmp, &path))
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            GfsError::io(format!("writing {}", path.display()), e)
        })
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let meta = prepare_meta(
            "http://example.com/data.bin",
            &MetaSeed::new().with_size(Some(1000)),
            256,
        );

        save_meta(dir.path(), &meta).unwrap();
        assert_eq!(load_meta(dir.path()).unwrap(), meta);
    }

    #[test]
    fn unknown_size_roundtrips_as_null() {
        let dir = TempDir::new().unwrap();
        let meta = prepare_meta("ftp://host/file", &MetaSeed::new(), 64);
        save_meta(dir.path(), &meta).unwrap();

        let content = fs::read_to_string(dir.path().join(META_FILE)).unwrap();
        assert!(content.contains("size: null"));
        assert_eq!(load_meta(dir.path()).unwrap().size, None);
    }

    #[test]
    fn cid_tracks_identity() {
        let base = MetaSeed::new()
            .with_size(Some(10))
            .with_tag(Some("\"etag-1\"".into()));
        let a = prepare_meta("s3://bucket/key", &base, 128);
        let same = prepare_meta("s3://bucket/key", &base, 128);
        let new_etag = prepare_meta(
            "s3://bucket/key",
            &base.clone().with_tag(Some("\"etag-2\"".into())),
            128,
        );
        let new_block_size = prepare_meta("s3://bucket/key", &base, 256);

        assert_eq!(a.cid, same.cid);
        assert_eq!(a.cid.len(), 16);
        assert_ne!(a.cid, new_etag.cid);
        assert_ne!(a.cid, new_block_size.cid);
    }

    #[test]
    fn seed_block_size_overrides_default() {
        let meta = prepare_meta("u", &MetaSeed::new().with_block_size(4096), 128);
        assert_eq!(meta.block_size, 4096);
        let meta = prepare_meta("u", &MetaSeed::new().with_block_size(0), 128);
        assert_eq!(meta.block_size, 128);
    }

    #[test]
    fn distinct_urls_get_distinct_keys() {
        let a = url_key("http://example.com/a");
        let b = url_key("http://example.com/b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 40);
        assert_eq!(a, url_key("http://example.com/a"));
    }

    #[test]
    fn corrupt_meta_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(META_FILE), "url: [unterminated").unwrap();
        assert!(matches!(
            load_meta(dir.path()),
            Err(GfsError::MetaInvalid { .. })
        ));
    }
}
