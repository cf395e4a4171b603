//! Size- and age-based cache cleanup
//!
//! A cleanup pass purges stale block generations from every entry, drops
//! temporary entry directories left by interrupted creations and finally
//! evicts whole entries, least recently used first, until the cache fits
//! into its size budget.

use crate::cache::block_file::{CachedBlockFile, BLOCKS_DIR};
use crate::cache::lockfile::{file_age, LockSettings};
use crate::cache::meta::META_FILE;
use crate::cache::{list_dir, BestEffort};
use crate::config::schema::CacheConfig;
use crate::error::{GfsError, GfsResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Sentinel whose mtime records the last cleanup pass
pub const LAST_CLEANUP_FILE: &str = ".last_cleanup";

/// Limits applied by a cleanup pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Age after which stale blocks and temp directories are removed
    pub max_age: Duration,
    /// Total size the cache is trimmed down to
    pub max_size: u64,
    /// Minimum time between two automatic passes
    pub period: Duration,
}

impl CleanupPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_age: Duration::from_secs(config.max_age_secs),
            max_size: config.max_size_bytes,
            period: Duration::from_secs(config.cleanup_period_secs),
        }
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// What a cleanup pass did
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Entry directories inspected
    pub entries: usize,
    /// Stale block files and link directories removed
    pub purged: usize,
    /// Whole entries evicted
    pub evicted: Vec<PathBuf>,
    /// Temporary entry directories removed
    pub temp_removed: Vec<PathBuf>,
    /// Entries left alone because another process held their lock
    pub skipped: Vec<PathBuf>,
    /// Cache size before eviction
    pub bytes_before: u64,
    /// Cache size after eviction
    pub bytes_after: u64,
    /// Removals that failed and were skipped
    pub failures: Vec<BestEffort>,
}

struct EntryUsage {
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
}

/// Run a full cleanup pass over `cache_dir`
pub fn cleanup_cache(
    cache_dir: &Path,
    policy: &CleanupPolicy,
    locks: &LockSettings,
) -> GfsResult<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut usage = Vec::new();

    for path in list_dir(cache_dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_dir() {
            continue;
        }

        if name.contains(".tmp-") {
            if file_age(&path).is_some_and(|age| age > policy.max_age) {
                remove_tree(&path, &mut report.failures, &mut report.temp_removed);
            }
            continue;
        }
        if !is_entry_name(name) {
            continue;
        }

        report.entries += 1;
        let guard = match locks.lock_for(&path).lock(Some(Duration::ZERO)) {
            Ok(guard) => guard,
            Err(GfsError::LockTimeout { .. }) => {
                debug!("Entry {} is busy, not purging", path.display());
                report.skipped.push(path.clone());
                report.bytes_before += entry_size(&path);
                continue;
            }
            Err(e) => return Err(e),
        };

        match CachedBlockFile::purge_blocks(&path, policy.max_age) {
            Ok(purge) => {
                report.purged += purge.removed.len();
                report.failures.extend(purge.failures);
            }
            Err(e) => report
                .failures
                .push(BestEffort::from_result(format!("purging {}", path.display()), Err(e))),
        }
        drop(guard);

        let size = entry_size(&path);
        report.bytes_before += size;
        usage.push(EntryUsage {
            last_used: last_used(&path),
            path,
            size,
        });
    }

    report.bytes_after = report.bytes_before;
    if report.bytes_after >= policy.max_size {
        evict_lru(usage, policy.max_size, locks, &mut report)?;
    }

    info!(
        "Cache cleanup of {}: {} entries, {} purged, {} evicted, {} -> {} bytes",
        cache_dir.display(),
        report.entries,
        report.purged,
        report.evicted.len(),
        report.bytes_before,
        report.bytes_after
    );
    Ok(report)
}

/// Run [`cleanup_cache`] unless a pass already ran within `policy.period`
pub fn maybe_cleanup_cache(
    cache_dir: &Path,
    policy: &CleanupPolicy,
    locks: &LockSettings,
) -> GfsResult<Option<CleanupReport>> {
    let sentinel = cache_dir.join(LAST_CLEANUP_FILE);
    if file_age(&sentinel).is_some_and(|age| age < policy.period) {
        return Ok(None);
    }

    fs::create_dir_all(cache_dir)
        .and_then(|()| fs::write(&sentinel, chrono::Utc::now().to_rfc3339()))
        .map_err(|e| GfsError::io(format!("writing {}", sentinel.display()), e))?;
    cleanup_cache(cache_dir, policy, locks).map(Some)
}

fn evict_lru(
    mut usage: Vec<EntryUsage>,
    max_size: u64,
    locks: &LockSettings,
    report: &mut CleanupReport,
) -> GfsResult<()> {
    usage.sort_by(|a, b| a.last_used.cmp(&b.last_used));

    // The budget is exclusive: a cache of exactly `max_size` bytes is over it
    for entry in usage {
        if report.bytes_after < max_size {
            break;
        }
        let _guard = match locks.lock_for(&entry.path).lock(Some(Duration::ZERO)) {
            Ok(guard) => guard,
            Err(GfsError::LockTimeout { .. }) => {
                debug!("Entry {} is busy, not evicting", entry.path.display());
                report.skipped.push(entry.path);
                continue;
            }
            Err(e) => return Err(e),
        };

        let before = report.evicted.len();
        remove_tree(&entry.path, &mut report.failures, &mut report.evicted);
        if report.evicted.len() > before {
            debug!("Evicted {} ({} bytes)", entry.path.display(), entry.size);
            report.bytes_after = report.bytes_after.saturating_sub(entry.size);
        }
    }
    Ok(())
}

fn remove_tree(path: &Path, failures: &mut Vec<BestEffort>, removed: &mut Vec<PathBuf>) {
    let outcome = BestEffort::from_result(
        format!("removing {}", path.display()),
        fs::remove_dir_all(path).map_err(|e| GfsError::io(format!("removing {}", path.display()), e)),
    );
    if outcome.is_done() {
        removed.push(path.to_path_buf());
    } else {
        failures.push(outcome);
    }
}

/// Entry directories are named by the hex SHA-1 of their URL
fn is_entry_name(name: &str) -> bool {
    name.len() == 40 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Bytes held by META and the block files.
///
/// `links/` holds hardlinks to blocks and is not counted twice.
fn entry_size(path: &Path) -> u64 {
    let meta = fs::metadata(path.join(META_FILE)).map(|m| m.len()).unwrap_or(0);
    let blocks = list_dir(&path.join(BLOCKS_DIR))
        .unwrap_or_default()
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum::<u64>();
    meta + blocks
}

/// Newest mtime among META and the block files
fn last_used(path: &Path) -> SystemTime {
    std::iter::once(path.join(META_FILE))
        .chain(list_dir(&path.join(BLOCKS_DIR)).unwrap_or_default())
        .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lockfile::LockFile;
    use crate::cache::meta::{prepare_meta, save_meta, url_key, MetaSeed};
    use crate::cache::testing::fast_locks;
    use std::fs::File;
    use tempfile::TempDir;

    /// Create an entry holding `size` bytes of block data last used `age` ago
    fn make_entry(cache: &Path, url: &str, size: usize, age: Duration) -> PathBuf {
        let entry = cache.join(url_key(url));
        fs::create_dir_all(entry.join(BLOCKS_DIR)).unwrap();
        let meta = prepare_meta(url, &MetaSeed::new().with_size(Some(size as u64)), 1 << 20);
        save_meta(&entry, &meta).unwrap();

        let block = entry.join(BLOCKS_DIR).join(format!("block-{}-0", meta.cid));
        fs::write(&block, vec![0u8; size]).unwrap();

        let when = SystemTime::now() - age;
        for path in [entry.join(META_FILE), block] {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(when)
                .unwrap();
        }
        entry
    }

    fn policy(max_size: u64) -> CleanupPolicy {
        CleanupPolicy {
            max_age: Duration::from_secs(300),
            max_size,
            period: Duration::from_secs(3600),
        }
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let dir = TempDir::new().unwrap();
        let oldest = make_entry(dir.path(), "http://h/a", 1000, Duration::from_secs(300));
        let middle = make_entry(dir.path(), "http://h/b", 1000, Duration::from_secs(200));
        let newest = make_entry(dir.path(), "http://h/c", 1000, Duration::from_secs(100));

        let report = cleanup_cache(dir.path(), &policy(2500), &fast_locks()).unwrap();

        assert_eq!(report.entries, 3);
        assert_eq!(report.evicted, vec![oldest.clone()]);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert!(report.bytes_after < 2500);
        assert!(!LockFile::for_target(&oldest).path().exists());
    }

    #[test]
    fn keeps_everything_under_budget() {
        let dir = TempDir::new().unwrap();
        make_entry(dir.path(), "http://h/a", 100, Duration::from_secs(10));
        make_entry(dir.path(), "http://h/b", 100, Duration::from_secs(10));

        let report = cleanup_cache(dir.path(), &policy(1 << 20), &fast_locks()).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.bytes_before, report.bytes_after);
    }

    #[test]
    fn cache_exactly_at_budget_is_reduced() {
        let dir = TempDir::new().unwrap();
        let older = make_entry(dir.path(), "http://h/a", 1000, Duration::from_secs(200));
        let newer = make_entry(dir.path(), "http://h/b", 1000, Duration::from_secs(100));
        let total = cleanup_cache(dir.path(), &policy(u64::MAX), &fast_locks())
            .unwrap()
            .bytes_before;

        let report = cleanup_cache(dir.path(), &policy(total), &fast_locks()).unwrap();

        assert_eq!(report.evicted, vec![older]);
        assert!(newer.exists());
        assert!(report.bytes_after < total);
    }

    #[test]
    fn busy_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let locked = make_entry(dir.path(), "http://h/a", 1000, Duration::from_secs(300));
        let other = make_entry(dir.path(), "http://h/b", 1000, Duration::from_secs(200));
        let _held = fast_locks().acquire(&locked).unwrap();

        let report = cleanup_cache(dir.path(), &policy(500), &fast_locks()).unwrap();

        assert!(locked.exists());
        assert!(!other.exists());
        assert_eq!(report.skipped, vec![locked]);
    }

    #[test]
    fn old_temp_entries_are_removed() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(format!("{}.tmp-1-00000000", url_key("u")));
        fs::create_dir_all(&tmp).unwrap();
        let fresh = CleanupPolicy {
            max_age: Duration::from_secs(3600),
            ..policy(1 << 30)
        };

        let report = cleanup_cache(dir.path(), &fresh, &fast_locks()).unwrap();
        assert!(report.temp_removed.is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let expired = CleanupPolicy {
            max_age: Duration::ZERO,
            ..policy(1 << 30)
        };
        let report = cleanup_cache(dir.path(), &expired, &fast_locks()).unwrap();
        assert_eq!(report.temp_removed, vec![tmp.clone()]);
        assert!(!tmp.exists());
    }

    #[test]
    fn foreign_directories_are_ignored() {
        let dir = TempDir::new().unwrap();
        let foreign = dir.path().join("not-an-entry");
        fs::create_dir_all(&foreign).unwrap();
        fs::write(foreign.join("file"), vec![0u8; 4096]).unwrap();

        let report = cleanup_cache(dir.path(), &policy(0), &fast_locks()).unwrap();
        assert_eq!(report.entries, 0);
        assert!(foreign.exists());
    }

    #[test]
    fn missing_cache_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let report =
            cleanup_cache(&dir.path().join("absent"), &policy(0), &fast_locks()).unwrap();
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn periodic_cleanup_is_throttled() {
        let dir = TempDir::new().unwrap();
        let locks = fast_locks();

        assert!(maybe_cleanup_cache(dir.path(), &policy(0), &locks)
            .unwrap()
            .is_some());
        assert!(dir.path().join(LAST_CLEANUP_FILE).exists());
        assert!(maybe_cleanup_cache(dir.path(), &policy(0), &locks)
            .unwrap()
            .is_none());

        let always = CleanupPolicy {
            period: Duration::ZERO,
            ..policy(0)
        };
        std::thread::sleep(Duration::from_millis(5));
        assert!(maybe_cleanup_cache(dir.path(), &always, &locks)
            .unwrap()
            .is_some());
    }

    #[test]
    fn entry_names_are_sha1_hex() {
        assert!(is_entry_name(&url_key("http://x")));
        assert!(!is_entry_name("blocks"));
        assert!(!is_entry_name(&format!("{}.lock", url_key("http://x"))));
    }
}
