//! On-disk block store for one cached URL
//!
//! An entry directory holds `META`, a `blocks/` directory with one file per
//! fetched block and a `links/` directory exposing whole-content fetches
//! under the URL's basename.

use crate::cache::lockfile::{append_suffix, file_age, LockFile, LockSettings};
use crate::cache::meta::{load_meta, save_meta, Meta};
use crate::cache::{list_dir, BestEffort};
use crate::error::{GfsError, GfsResult};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Directory holding block files
pub const BLOCKS_DIR: &str = "blocks";
/// Directory holding public hardlinks to whole-content blocks
pub const LINKS_DIR: &str = "links";

const BLOCK_PREFIX: &str = "block-";
const TMP_MARKER: &str = ".tmp-";

/// Byte range a reader is asked to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSpan {
    /// The entire resource
    Whole,
    /// `size` bytes starting at `offset`
    Range { offset: u64, size: u64 },
}

/// Protocol-specific capability used by the cache to fetch raw bytes
pub trait BlockReader: Send + Sync {
    /// Whether the source can serve arbitrary byte ranges
    fn support_blocks(&self) -> bool;

    /// Write the bytes of `span` into a new file at `dest`, returning the
    /// number of bytes written. A range reaching past the end of the
    /// resource yields a short (possibly empty) file.
    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64>;
}

/// Bytes of one block, positioned at their logical offset
#[derive(Debug, Clone)]
pub struct Block {
    base: u64,
    data: Arc<[u8]>,
}

impl Block {
    /// Logical offset of the first byte
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Logical offset one past the last byte
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `offset` falls inside this block
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base && offset < self.end()
    }

    /// Bytes from logical `offset` to the end of the block
    pub fn bytes_from(&self, offset: u64) -> &[u8] {
        if !self.contains(offset) {
            return &[];
        }
        &self.data[(offset - self.base) as usize..]
    }

    /// All bytes of the block
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Outcome of [`CachedBlockFile::purge_blocks`]
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Files and directories removed
    pub removed: Vec<PathBuf>,
    /// Removals that failed and were skipped
    pub failures: Vec<BestEffort>,
}

/// A cache entry directory plus the reader that fills it
pub struct CachedBlockFile {
    path: PathBuf,
    reader: Arc<dyn BlockReader>,
    meta: Mutex<Meta>,
    locks: LockSettings,
}

impl CachedBlockFile {
    /// Build a new entry at `path`.
    ///
    /// The directory tree is assembled under a temporary sibling name and
    /// renamed into place; on failure the temporary tree is removed.
    pub fn create(
        path: &Path,
        meta: Meta,
        reader: Arc<dyn BlockReader>,
        locks: LockSettings,
    ) -> GfsResult<Self> {
        let tmp = temp_sibling(path);
        let built = (|| {
            fs::create_dir_all(tmp.join(BLOCKS_DIR))
                .and_then(|()| fs::create_dir_all(tmp.join(LINKS_DIR)))
                .map_err(|e| GfsError::io(format!("creating {}", tmp.display()), e))?;
            save_meta(&tmp, &meta)?;
            fs::rename(&tmp, path)
                .map_err(|e| GfsError::io(format!("installing {}", path.display()), e))
        })();

        if let Err(e) = built {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        debug!("Created cache entry {} for {}", path.display(), meta.url);
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            meta: Mutex::new(meta),
            locks,
        })
    }

    /// Open an existing entry
    pub fn open(path: &Path, reader: Arc<dyn BlockReader>, locks: LockSettings) -> GfsResult<Self> {
        let meta = load_meta(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            meta: Mutex::new(meta),
            locks,
        })
    }

    /// Entry directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current metadata
    pub fn meta(&self) -> Meta {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Persist new metadata (for instance after the content identity changed).
    ///
    /// Callers must hold the entry lock.
    pub fn replace_meta(&self, meta: Meta) -> GfsResult<()> {
        save_meta(&self.path, &meta)?;
        *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = meta;
        Ok(())
    }

    /// Path of the block at `offset`, or of the whole-content block
    pub fn block_path(&self, cid: &str, offset: Option<u64>) -> PathBuf {
        let name = match offset {
            Some(offset) => format!("{}{}-{}", BLOCK_PREFIX, cid, offset),
            None => format!("{}{}", BLOCK_PREFIX, cid),
        };
        self.path.join(BLOCKS_DIR).join(name)
    }

    /// Public hardlink path of the whole-content block
    pub fn link_path(&self, meta: &Meta) -> PathBuf {
        self.path
            .join(LINKS_DIR)
            .join(&meta.cid)
            .join(url_basename(&meta.url))
    }

    /// Read the block starting at `offset`.
    ///
    /// `offset` must be a multiple of the block size. When the whole content
    /// is cached (or the reader cannot serve ranges) the block is cut out of
    /// the whole-content file instead of fetching it separately.
    pub fn read_block(&self, offset: u64) -> GfsResult<Block> {
        let meta = self.meta();
        if offset % meta.block_size != 0 {
            return Err(GfsError::MisalignedOffset {
                offset,
                block_size: meta.block_size,
            });
        }

        let whole = self.block_path(&meta.cid, None);
        if whole.exists() || !self.reader.support_blocks() {
            self.ensure_block(&whole, BlockSpan::Whole, &meta)?;
            return read_range(&whole, offset, meta.block_size);
        }

        let mut size = meta.block_size;
        if let Some(total) = meta.size {
            if offset >= total {
                return Ok(Block {
                    base: offset,
                    data: Arc::from(Vec::new()),
                });
            }
            size = size.min(total - offset);
        }

        let path = self.block_path(&meta.cid, Some(offset));
        self.ensure_block(&path, BlockSpan::Range { offset, size }, &meta)?;
        read_range(&path, 0, size).map(|block| Block {
            base: offset,
            data: block.data,
        })
    }

    /// Fetch the whole content if it is not cached yet
    pub fn fetch_whole(&self) -> GfsResult<PathBuf> {
        let meta = self.meta();
        let whole = self.block_path(&meta.cid, None);
        self.ensure_block(&whole, BlockSpan::Whole, &meta)?;
        Ok(whole)
    }

    /// Best local path of the whole content: the public link when it exists
    pub fn local_path(&self) -> GfsResult<PathBuf> {
        let whole = self.fetch_whole()?;
        let link = self.link_path(&self.meta());
        Ok(if link.exists() { link } else { whole })
    }

    /// Content length, fetching the whole content when it is unknown
    pub fn size(&self) -> GfsResult<u64> {
        if let Some(size) = self.meta().size {
            return Ok(size);
        }

        let whole = self.fetch_whole()?;
        let size = fs::metadata(&whole)
            .map_err(|e| GfsError::io(format!("reading {}", whole.display()), e))?
            .len();

        let _guard = self.locks.acquire(&self.path)?;
        let mut meta = load_meta(&self.path)?;
        if meta.cid == self.meta().cid {
            meta.size = Some(size);
            self.replace_meta(meta)?;
            debug!("Learned size {} for {}", size, self.path.display());
        }
        Ok(size)
    }

    /// Make sure the block file at `path` exists, fetching it at most once
    /// across all processes sharing the cache.
    fn ensure_block(&self, path: &Path, span: BlockSpan, meta: &Meta) -> GfsResult<bool> {
        if path.exists() {
            return Ok(false);
        }

        let _guard = self.locks.acquire(path)?;
        if path.exists() {
            debug!("Block {} was fetched while waiting", path.display());
            return Ok(false);
        }

        let tmp = temp_sibling(path);
        let written = match self.reader.read_block(&tmp, span) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(GfsError::io(format!("installing {}", path.display()), e));
        }
        debug!("Fetched {} bytes of {} into {}", written, meta.url, path.display());

        if span == BlockSpan::Whole {
            self.link_whole(path, meta).log();
        }
        Ok(true)
    }

    fn link_whole(&self, whole: &Path, meta: &Meta) -> BestEffort {
        let link = self.link_path(meta);
        BestEffort::from_result(format!("linking {}", link.display()), (|| {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(whole, fs::Permissions::from_mode(0o444))
                    .map_err(|e| GfsError::io("making block read-only", e))?;
            }
            if link.exists() {
                return Ok(());
            }
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| GfsError::io(format!("creating {}", parent.display()), e))?;
            }
            fs::hard_link(whole, &link).map_err(|e| GfsError::io("creating hardlink", e))
        })())
    }

    /// Remove blocks of previous content generations older than `max_age`.
    ///
    /// Also removes link directories of old generations and temporary files
    /// left behind by interrupted fetches. Individual removal failures are
    /// collected in the report instead of aborting the scan.
    pub fn purge_blocks(path: &Path, max_age: Duration) -> GfsResult<PurgeReport> {
        let meta = load_meta(path)?;
        let mut report = PurgeReport::default();
        let is_old = |p: &Path| file_age(p).is_some_and(|age| age > max_age);

        for entry in list_dir(&path.join(BLOCKS_DIR))? {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let old_generation = block_cid(name) != Some(meta.cid.as_str());
            let stale = if name.ends_with(".lock") {
                old_generation && !held_by_live_process(&entry)
            } else if name.ends_with(".remover") {
                old_generation
            } else {
                old_generation || name.contains(TMP_MARKER)
            };
            if stale && is_old(&entry) {
                record_removal(&mut report, entry, |p| fs::remove_file(p));
            }
        }

        for entry in list_dir(&path.join(LINKS_DIR))? {
            let current = entry.file_name().and_then(|n| n.to_str()) == Some(meta.cid.as_str());
            if !current && is_old(&entry) {
                record_removal(&mut report, entry, |p| fs::remove_dir_all(p));
            }
        }

        if !report.removed.is_empty() {
            info!(
                "Purged {} stale files from {}",
                report.removed.len(),
                path.display()
            );
        }
        Ok(report)
    }
}

fn record_removal(
    report: &mut PurgeReport,
    path: PathBuf,
    remove: impl FnOnce(&Path) -> std::io::Result<()>,
) {
    let outcome = BestEffort::from_result(
        format!("removing {}", path.display()),
        remove(&path).map_err(|e| GfsError::io(format!("removing {}", path.display()), e)),
    );
    if outcome.is_done() {
        report.removed.push(path);
    } else {
        report.failures.push(outcome);
    }
}

/// Whether the lock file at `path` is tagged by a running process
fn held_by_live_process(path: &Path) -> bool {
    LockFile::new(path).holder().is_some_and(|tag| tag.is_alive())
}

/// Content identity embedded in a block file name
fn block_cid(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(BLOCK_PREFIX)?;
    let cid = rest.split(['-', '.']).next()?;
    (!cid.is_empty()).then_some(cid)
}


/// Read at most `len` bytes of `path` starting at `offset`
fn read_range(path: &Path, offset: u64, len: u64) -> GfsResult<Block> {
    let mut file =
        File::open(path).map_err(|e| GfsError::io(format!("opening {}", path.display()), e))?;
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.take(len).read_to_end(&mut data))
        .map_err(|e| GfsError::io(format!("reading {}", path.display()), e))?;
    Ok(Block {
        base: offset,
        data: Arc::from(data),
    })
}

/// Unique temporary name next to `path`
fn temp_sibling(path: &Path) -> PathBuf {
    append_suffix(
        path,
        &format!("{}{}-{:08x}", TMP_MARKER, std::process::id(), rand::random::<u32>()),
    )
}

/// Last path segment of a URL, without query or fragment
pub(crate) fn url_basename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    if name.is_empty() || name.contains(':') {
        "data".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lockfile::LockTag;
    use crate::cache::meta::{prepare_meta, MetaSeed};
    use crate::cache::testing::{fast_locks, MemoryReader};
    use std::thread;
    use tempfile::TempDir;

    fn entry(dir: &TempDir, reader: Arc<MemoryReader>, seed: MetaSeed) -> CachedBlockFile {
        let meta = prepare_meta("http://example.com/files/data.bin", &seed, 100);
        CachedBlockFile::create(&dir.path().join("entry"), meta, reader, fast_locks()).unwrap()
    }

    #[test]
    fn create_builds_layout() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![1; 10], true));
        let file = entry(&dir, reader, MetaSeed::new());

        assert!(file.path().join("META").is_file());
        assert!(file.path().join(BLOCKS_DIR).is_dir());
        assert!(file.path().join(LINKS_DIR).is_dir());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn create_rolls_back_on_failure() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("entry");
        fs::create_dir_all(target.join("occupied")).unwrap();
        let meta = prepare_meta("u", &MetaSeed::new(), 100);
        let reader = Arc::new(MemoryReader::new(vec![], true));

        assert!(CachedBlockFile::create(&target, meta, reader, fast_locks()).is_err());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("entry")]);
    }

    #[test]
    fn misaligned_offset_fails_before_fetch() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![7; 1000], true));
        let file = entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(1000)));

        let err = file.read_block(150).unwrap_err();
        assert!(matches!(err, GfsError::MisalignedOffset { .. }));
        assert_eq!(reader.calls(), 0);
        assert_eq!(fs::read_dir(file.path().join(BLOCKS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn blocks_are_fetched_once() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let reader = Arc::new(MemoryReader::new(data.clone(), true));
        let file = entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(250)));

        let block = file.read_block(100).unwrap();
        assert_eq!(block.base(), 100);
        assert_eq!(block.data(), &data[100..200]);
        let again = file.read_block(100).unwrap();
        assert_eq!(again.data(), block.data());

        let last = file.read_block(200).unwrap();
        assert_eq!(last.data(), &data[200..]);
        assert_eq!(reader.calls(), 2);
        assert!(file.read_block(300).unwrap().is_empty());
    }

    #[test]
    fn concurrent_readers_fetch_once() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![3; 500], true).with_delay_ms(100));
        let file = Arc::new(entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(500))));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let file = file.clone();
                thread::spawn(move || file.read_block(200).unwrap().len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 100);
        }
        assert_eq!(reader.calls(), 1);
    }

    #[test]
    fn whole_content_serves_every_offset() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let reader = Arc::new(MemoryReader::new(data.clone(), false));
        let file = entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(1000)));

        assert_eq!(file.read_block(0).unwrap().data(), &data[..100]);
        let block = file.read_block(500).unwrap();
        assert_eq!(block.base(), 500);
        assert_eq!(block.data(), &data[500..600]);
        assert_eq!(reader.calls(), 1);
        assert_eq!(reader.spans(), vec![BlockSpan::Whole]);

        let meta = file.meta();
        let link = file.link_path(&meta);
        assert_eq!(link.file_name().unwrap(), "data.bin");
        assert_eq!(fs::read(link).unwrap(), data);
    }

    #[test]
    fn cached_whole_content_bypasses_block_fetches() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![5; 300], true));
        let file = entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(300)));

        file.fetch_whole().unwrap();
        assert_eq!(file.read_block(200).unwrap().len(), 100);
        assert_eq!(reader.calls(), 1);
    }

    #[test]
    fn unknown_size_is_learned_and_persisted() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![9; 321], false));
        let file = entry(&dir, reader.clone(), MetaSeed::new());

        assert_eq!(file.size().unwrap(), 321);
        assert_eq!(load_meta(file.path()).unwrap().size, Some(321));
        assert_eq!(file.size().unwrap(), 321);
        assert_eq!(reader.calls(), 1);
    }

    #[test]
    fn failed_fetch_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![1; 100], true).failing());
        let file = entry(&dir, reader, MetaSeed::new().with_size(Some(100)));

        assert!(file.read_block(0).is_err());
        assert_eq!(fs::read_dir(file.path().join(BLOCKS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn purge_removes_only_old_generations() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![1; 300], true));
        let file = entry(&dir, reader.clone(), MetaSeed::new().with_size(Some(300)));
        file.read_block(0).unwrap();

        let blocks = file.path().join(BLOCKS_DIR);
        let stale = blocks.join("block-00000000deadbeef-0");
        fs::write(&stale, b"old").unwrap();
        let stale_link = file.path().join(LINKS_DIR).join("00000000deadbeef");
        fs::create_dir_all(&stale_link).unwrap();

        let report = CachedBlockFile::purge_blocks(file.path(), Duration::from_secs(3600)).unwrap();
        assert!(report.removed.is_empty());

        thread::sleep(Duration::from_millis(20));
        let report = CachedBlockFile::purge_blocks(file.path(), Duration::ZERO).unwrap();
        assert!(report.failures.is_empty());
        assert!(!stale.exists());
        assert!(!stale_link.exists());
        assert!(file.block_path(&file.meta().cid, Some(0)).exists());
    }

    #[test]
    fn purge_reclaims_abandoned_locks_of_old_generations() {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(MemoryReader::new(vec![1; 300], true));
        let file = entry(&dir, reader, MetaSeed::new().with_size(Some(300)));
        let blocks = file.path().join(BLOCKS_DIR);

        let abandoned = blocks.join("block-00000000deadbeef-0.lock");
        fs::write(&abandoned, "").unwrap();
        let marker = blocks.join("block-00000000deadbeef-64.lock.remover");
        fs::write(&marker, "").unwrap();
        let held = blocks.join("block-00000000feedface-0.lock");
        fs::write(&held, serde_yaml::to_string(&LockTag::current()).unwrap()).unwrap();
        let current = blocks.join(format!("block-{}-0.lock", file.meta().cid));
        fs::write(&current, "").unwrap();

        thread::sleep(Duration::from_millis(20));
        let report = CachedBlockFile::purge_blocks(file.path(), Duration::ZERO).unwrap();

        assert!(report.failures.is_empty());
        assert!(!abandoned.exists());
        assert!(!marker.exists());
        assert!(held.exists());
        assert!(current.exists());
    }

    #[test]
    fn block_names_yield_cid() {
        assert_eq!(block_cid("block-0123456789abcdef"), Some("0123456789abcdef"));
        assert_eq!(block_cid("block-0123456789abcdef-4096"), Some("0123456789abcdef"));
        assert_eq!(
            block_cid("block-0123456789abcdef-0.tmp-12-00ff00ff"),
            Some("0123456789abcdef")
        );
        assert_eq!(block_cid("META"), None);
    }

    #[test]
    fn basename_of_urls() {
        assert_eq!(url_basename("http://h/a/b.txt?x=1"), "b.txt");
        assert_eq!(url_basename("s3://bucket/dir/"), "dir");
        assert_eq!(url_basename("http://host"), "host");
        assert_eq!(url_basename("s3://"), "data");
    }
}
