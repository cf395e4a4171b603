//! Entry point used by backends to read remote content through the cache

use crate::cache::block_file::{BlockReader, CachedBlockFile};
use crate::cache::cached_file::CachedFile;
use crate::cache::cleanup::{cleanup_cache, maybe_cleanup_cache, CleanupPolicy, CleanupReport};
use crate::cache::lockfile::LockSettings;
use crate::cache::meta::{prepare_meta, url_key, MetaSeed, META_FILE};
use crate::cache::BestEffort;
use crate::config::schema::CacheConfig;
use crate::error::{GfsError, GfsResult};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Shared handle on one cache directory
#[derive(Debug, Clone)]
pub struct CacheInterface {
    dir: PathBuf,
    block_size: u64,
    locks: LockSettings,
    policy: CleanupPolicy,
    auto_cleanup: bool,
}

impl CacheInterface {
    /// Cache rooted at `dir` with default settings
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = CacheConfig::default();
        Self {
            dir: dir.into(),
            block_size: defaults.block_size,
            locks: LockSettings::from_config(&defaults),
            policy: CleanupPolicy::from_config(&defaults),
            auto_cleanup: defaults.auto_cleanup,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            dir: config.dir(),
            block_size: config.block_size.max(1),
            locks: LockSettings::from_config(config),
            policy: CleanupPolicy::from_config(config),
            auto_cleanup: config.auto_cleanup,
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_locks(mut self, locks: LockSettings) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    /// Cache root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn locks(&self) -> &LockSettings {
        &self.locks
    }

    pub fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Entry directory for `url` (whether or not it exists)
    pub fn entry_path(&self, url: &str) -> PathBuf {
        self.dir.join(url_key(url))
    }

    /// Open or create the entry for `url` and bring its identity up to date.
    ///
    /// Under the entry lock: a missing or unreadable entry is (re)created, an
    /// entry whose content identity changed gets its `META` rewritten, and
    /// the `META` mtime is refreshed as the entry's last use.
    pub fn open_entry(
        &self,
        url: &str,
        seed: &MetaSeed,
        reader: Arc<dyn BlockReader>,
    ) -> GfsResult<Arc<CachedBlockFile>> {
        if self.auto_cleanup {
            self.maybe_cleanup().log();
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| GfsError::io(format!("creating cache dir {}", self.dir.display()), e))?;

        let meta = prepare_meta(url, seed, self.block_size);
        let entry = self.entry_path(url);
        let _guard = self.locks.acquire(&entry)?;

        if !entry.exists() {
            return CachedBlockFile::create(&entry, meta, reader, self.locks).map(Arc::new);
        }

        let file = match CachedBlockFile::open(&entry, reader.clone(), self.locks) {
            Ok(file) => file,
            Err(e) if is_broken_entry(&e) => {
                warn!("Recreating broken cache entry {}: {}", entry.display(), e);
                fs::remove_dir_all(&entry)
                    .map_err(|e| GfsError::io(format!("removing {}", entry.display()), e))?;
                return CachedBlockFile::create(&entry, meta, reader, self.locks).map(Arc::new);
            }
            Err(e) => return Err(e),
        };

        let current = file.meta();
        if current.cid != meta.cid {
            info!(
                "Content of {} changed ({} -> {}), refreshing cache entry",
                url, current.cid, meta.cid
            );
            file.replace_meta(meta)?;
        } else {
            debug!("Reusing cache entry {} for {}", entry.display(), url);
        }

        touch(&entry.join(META_FILE)).log();
        Ok(Arc::new(file))
    }

    /// Open a seekable stream over `url`
    pub fn open(
        &self,
        url: &str,
        seed: &MetaSeed,
        reader: Arc<dyn BlockReader>,
    ) -> GfsResult<CachedFile> {
        CachedFile::new(self.open_entry(url, seed, reader)?)
    }

    /// Fetch the whole content of `url` and return a local path to it
    pub fn as_local(
        &self,
        url: &str,
        seed: &MetaSeed,
        reader: Arc<dyn BlockReader>,
    ) -> GfsResult<PathBuf> {
        self.open_entry(url, seed, reader)?.local_path()
    }

    /// Remove the entry for `url`. Returns `false` when nothing was cached.
    pub fn purge(&self, url: &str) -> GfsResult<bool> {
        if !self.dir.is_dir() {
            return Ok(false);
        }
        let entry = self.entry_path(url);
        let _guard = self.locks.acquire(&entry)?;
        match fs::remove_dir_all(&entry) {
            Ok(()) => {
                info!("Purged cache entry for {}", url);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GfsError::io(format!("removing {}", entry.display()), e)),
        }
    }

    /// Run a full cleanup pass now
    pub fn cleanup(&self) -> GfsResult<CleanupReport> {
        cleanup_cache(&self.dir, &self.policy, &self.locks)
    }

    /// Run a cleanup pass if the cleanup period has elapsed
    fn maybe_cleanup(&self) -> BestEffort {
        BestEffort::from_result(
            "automatic cache cleanup",
            maybe_cleanup_cache(&self.dir, &self.policy, &self.locks).map(|_| ()),
        )
    }
}

fn is_broken_entry(e: &GfsError) -> bool {
    match e {
        GfsError::MetaInvalid { .. } => true,
        GfsError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

fn touch(path: &Path) -> BestEffort {
    BestEffort::from_result(
        format!("touching {}", path.display()),
        File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .map_err(|e| GfsError::io(format!("touching {}", path.display()), e)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::meta::load_meta;
    use crate::cache::testing::{fast_locks, MemoryReader};
    use std::io::Read;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "https://example.com/data/table.csv";

    fn cache(dir: &TempDir) -> CacheInterface {
        CacheInterface::new(dir.path().join("cache"))
            .with_block_size(64)
            .with_locks(fast_locks())
            .with_auto_cleanup(false)
    }

    fn seed(size: u64, tag: &str) -> MetaSeed {
        MetaSeed::new()
            .with_size(Some(size))
            .with_tag(Some(tag.to_string()))
    }

    #[test]
    fn reopening_does_not_refetch() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let reader = Arc::new(MemoryReader::new(data.clone(), true));

        let mut first = cache.open(URL, &seed(200, "v1"), reader.clone()).unwrap();
        let mut out = Vec::new();
        first.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        let fetched = reader.calls();

        let mut second = cache.open(URL, &seed(200, "v1"), reader.clone()).unwrap();
        out.clear();
        second.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.calls(), fetched);
    }

    #[test]
    fn changed_content_rewrites_meta() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let old = Arc::new(MemoryReader::new(vec![1; 100], true));
        let new = Arc::new(MemoryReader::new(vec![2; 100], true));

        let mut file = cache.open(URL, &seed(100, "v1"), old).unwrap();
        assert_eq!(file.read_bytes(Some(1)).unwrap(), vec![1]);
        let old_cid = load_meta(&cache.entry_path(URL)).unwrap().cid;

        let mut file = cache.open(URL, &seed(100, "v2"), new.clone()).unwrap();
        assert_eq!(file.read_bytes(Some(1)).unwrap(), vec![2]);
        assert_eq!(new.calls(), 1);
        assert_ne!(load_meta(&cache.entry_path(URL)).unwrap().cid, old_cid);
    }

    #[test]
    fn broken_meta_recreates_entry() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let reader = Arc::new(MemoryReader::new(vec![4; 10], true));
        cache.open(URL, &seed(10, "v1"), reader.clone()).unwrap();

        fs::write(cache.entry_path(URL).join(META_FILE), "::not yaml::").unwrap();
        let mut file = cache.open(URL, &seed(10, "v1"), reader).unwrap();
        assert_eq!(file.read_bytes(None).unwrap(), vec![4; 10]);
    }

    #[test]
    fn as_local_returns_named_link() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let reader = Arc::new(MemoryReader::new(b"a,b\n1,2\n".to_vec(), true));

        let path = cache.as_local(URL, &MetaSeed::new(), reader.clone()).unwrap();
        assert_eq!(path.file_name().unwrap(), "table.csv");
        assert_eq!(fs::read(&path).unwrap(), b"a,b\n1,2\n");

        let again = cache.as_local(URL, &MetaSeed::new(), reader.clone()).unwrap();
        assert_eq!(again, path);
        assert_eq!(reader.calls(), 1);
    }

    #[test]
    fn open_creates_missing_cache_dir() {
        let dir = TempDir::new().unwrap();
        let cache = CacheInterface::new(dir.path().join("nested/cache"))
            .with_block_size(64)
            .with_locks(fast_locks())
            .with_auto_cleanup(false);
        let reader = Arc::new(MemoryReader::new(vec![7; 20], true));

        let mut file = cache.open(URL, &seed(20, "v1"), reader).unwrap();
        assert_eq!(file.read_bytes(None).unwrap(), vec![7; 20]);
        assert!(cache.entry_path(URL).join(META_FILE).is_file());
    }

    #[test]
    fn purge_without_cache_dir_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(!cache.purge(URL).unwrap());
        assert!(!cache.dir().exists());
    }

    #[test]
    fn purge_removes_entry() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let reader = Arc::new(MemoryReader::new(vec![0; 10], true));
        cache.open(URL, &seed(10, "v1"), reader).unwrap();

        assert!(cache.purge(URL).unwrap());
        assert!(!cache.entry_path(URL).exists());
        assert!(!cache.purge(URL).unwrap());
    }

    #[test]
    fn concurrent_opens_share_one_entry() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(&dir));
        let reader = Arc::new(MemoryReader::new(vec![8; 64], true).with_delay_ms(20));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                let reader = reader.clone();
                thread::spawn(move || {
                    let mut file = cache.open(URL, &seed(64, "v1"), reader).unwrap();
                    file.read_bytes(None).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![8; 64]);
        }
        assert_eq!(reader.calls(), 1);
        let entries = fs::read_dir(cache.dir())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn open_triggers_throttled_cleanup() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir).with_auto_cleanup(true).with_policy(CleanupPolicy {
            max_age: Duration::from_secs(60),
            max_size: u64::MAX,
            period: Duration::from_secs(3600),
        });
        let reader = Arc::new(MemoryReader::new(vec![0; 10], true));

        cache.open(URL, &seed(10, "v1"), reader).unwrap();
        assert!(cache
            .dir()
            .join(crate::cache::cleanup::LAST_CLEANUP_FILE)
            .exists());
    }

    #[test]
    fn distinct_urls_get_distinct_entries() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert_ne!(
            cache.entry_path("http://h/a"),
            cache.entry_path("http://h/b")
        );
    }
}
