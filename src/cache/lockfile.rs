//! Advisory lock files tagged with the holder's identity
//!
//! A lock is a regular file created with exclusive-create semantics whose
//! content is a YAML tag `{pid, cmdline, time, hostname}`. Waiters poll the
//! file and periodically check whether the recorded holder is still alive;
//! locks abandoned by crashed processes are taken over.

use crate::config::schema::CacheConfig;
use crate::error::{GfsError, GfsResult};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A takeover marker older than this belongs to a crashed remover
const REMOVER_STALE_AFTER: Duration = Duration::from_secs(30);

/// Shortest sleep between two attempts
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Start times are derived from clock ticks and a whole-second boot time
const START_TIME_SLACK_SECS: f64 = 1.0;

/// Identity of a lock holder, stored as the lock file content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockTag {
    /// Holder process id
    pub pid: u32,
    /// Holder command line
    pub cmdline: String,
    /// Unix time at which the lock was taken
    pub time: f64,
    /// Host the holder runs on
    pub hostname: String,
}

impl LockTag {
    /// Tag describing the current process, timestamped now
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            cmdline: current_cmdline(),
            time: unix_now(),
            hostname: current_hostname(),
        }
    }

    /// Whether this tag was written by the current process
    pub fn is_ours(&self) -> bool {
        self.pid == std::process::id() && self.cmdline == current_cmdline()
    }

    /// Whether the recorded holder still runs.
    ///
    /// Holders on other hosts cannot be inspected and always count as alive.
    pub fn is_alive(&self) -> bool {
        if self.hostname != current_hostname() {
            return true;
        }
        if !process_exists(self.pid) {
            return false;
        }
        if let Some(cmdline) = process_cmdline(self.pid) {
            if cmdline != self.cmdline {
                return false;
            }
        }
        if let Some(started) = process_start_time(self.pid) {
            if started > self.time + START_TIME_SLACK_SECS {
                return false;
            }
        }
        true
    }

    fn to_yaml(&self) -> GfsResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Timing knobs shared by every lock the cache takes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockSettings {
    /// Give up after this long (`None` waits forever)
    pub timeout: Option<Duration>,
    /// Mean delay between creation attempts
    pub retry_interval: Duration,
    /// Mean delay between holder liveness checks
    pub check_interval: Duration,
}

impl LockSettings {
    /// Build settings from cache configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            timeout: config.lock_timeout_secs.map(Duration::from_secs),
            retry_interval: Duration::from_millis(config.lock_retry_ms),
            check_interval: Duration::from_millis(config.lock_check_ms),
        }
    }

    /// Lock guarding `target` (the lock file is `<target>.lock`)
    pub fn lock_for(&self, target: &Path) -> LockFile {
        LockFile::for_target(target)
            .with_retry_interval(self.retry_interval)
            .with_check_interval(self.check_interval)
    }

    /// Take the lock guarding `target`, honoring the configured timeout
    pub fn acquire(&self, target: &Path) -> GfsResult<LockGuard> {
        self.lock_for(target).lock(self.timeout)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// An advisory, PID/host-tagged lock file
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    retry_interval: Duration,
    check_interval: Duration,
}

impl LockFile {
    /// Lock stored at exactly `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_interval: Duration::from_millis(500),
            check_interval: Duration::from_millis(2500),
        }
    }

    /// Lock guarding `target`, stored at `<target>.lock`
    pub fn for_target(target: &Path) -> Self {
        Self::new(append_suffix(target, ".lock"))
    }

    /// Set the mean delay between creation attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the mean delay between liveness checks
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, waiting at most `timeout` (`None` = forever).
    ///
    /// Returns `Ok(false)` when the timeout elapses. Errors are reserved for
    /// I/O failures other than contention.
    pub fn acquire(&self, timeout: Option<Duration>) -> GfsResult<bool> {
        let tag = LockTag::current();
        let started = Instant::now();
        let mut next_check = started + jitter(self.check_interval, 0.2);

        loop {
            if self.try_create(&tag)? {
                debug!("Acquired lock {}", self.path.display());
                return Ok(true);
            }

            let now = Instant::now();
            if now >= next_check {
                next_check = now + jitter(self.check_interval, 0.2);
                if let Some(observed) = self.read_raw()? {
                    if self.holder_is_dead(&observed) && self.try_takeover(&observed, &tag)? {
                        return Ok(true);
                    }
                }
            }

            let mut pause = jitter(self.retry_interval, 0.4);
            if let Some(timeout) = timeout {
                let waited = now.duration_since(started);
                if waited >= timeout {
                    debug!("Gave up on lock {} after {:?}", self.path.display(), waited);
                    return Ok(false);
                }
                pause = pause.min(timeout - waited);
            }
            thread::sleep(pause);
        }
    }

    /// Take the lock or fail with [`GfsError::LockTimeout`]
    pub fn lock(&self, timeout: Option<Duration>) -> GfsResult<LockGuard> {
        let started = Instant::now();
        if self.acquire(timeout)? {
            Ok(LockGuard { lock: self.clone() })
        } else {
            Err(GfsError::LockTimeout {
                path: self.path.clone(),
                waited: started.elapsed(),
            })
        }
    }

    /// Release the lock if the current process holds it.
    ///
    /// A lock held by someone else is left alone and `false` is returned.
    pub fn release(&self) -> bool {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock {} was already released", self.path.display());
                return false;
            }
            Err(e) => {
                warn!("Cannot read lock {}: {}", self.path.display(), e);
                return false;
            }
        };

        match serde_yaml::from_str::<LockTag>(&raw) {
            Ok(tag) if tag.is_ours() => match fs::remove_file(&self.path) {
                Ok(()) => {
                    debug!("Released lock {}", self.path.display());
                    true
                }
                Err(e) => {
                    warn!("Cannot remove lock {}: {}", self.path.display(), e);
                    false
                }
            },
            Ok(tag) => {
                warn!(
                    "Not releasing lock {} held by pid {} on {}",
                    self.path.display(),
                    tag.pid,
                    tag.hostname
                );
                false
            }
            Err(e) => {
                warn!("Not releasing unreadable lock {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Current holder, if the lock exists and is readable
    pub fn holder(&self) -> Option<LockTag> {
        let raw = fs::read_to_string(&self.path).ok()?;
        serde_yaml::from_str(&raw).ok()
    }

    fn try_create(&self, tag: &LockTag) -> GfsResult<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(GfsError::io(
                    format!("creating lock {}", self.path.display()),
                    e,
                ))
            }
        };

        let written = tag
            .to_yaml()
            .and_then(|yaml| {
                file.write_all(yaml.as_bytes())
                    .map_err(|e| GfsError::io(format!("writing lock {}", self.path.display()), e))
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(true)
    }

    fn read_raw(&self) -> GfsResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GfsError::io(
                format!("reading lock {}", self.path.display()),
                e,
            )),
        }
    }

    /// A holder is dead when its tag says so. An unreadable tag only counts
    /// as dead once the file is older than a check interval, since the
    /// holder may sit between creating the file and writing it.
    fn holder_is_dead(&self, raw: &str) -> bool {
        match serde_yaml::from_str::<LockTag>(raw) {
            Ok(tag) => !tag.is_alive(),
            Err(_) => file_age(&self.path).is_some_and(|age| age > self.check_interval),
        }
    }

    fn try_takeover(&self, observed: &str, tag: &LockTag) -> GfsResult<bool> {
        let remover = append_suffix(&self.path, ".remover");
        match OpenOptions::new().write(true).create_new(true).open(&remover) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if file_age(&remover).is_some_and(|age| age > REMOVER_STALE_AFTER) {
                    warn!("Removing stale takeover marker {}", remover.display());
                    let _ = fs::remove_file(&remover);
                }
                return Ok(false);
            }
            Err(e) => {
                return Err(GfsError::io(
                    format!("creating takeover marker {}", remover.display()),
                    e,
                ))
            }
        }

        let result = self.overwrite_if_unchanged(observed, tag);
        let _ = fs::remove_file(&remover);
        result
    }

    fn overwrite_if_unchanged(&self, observed: &str, tag: &LockTag) -> GfsResult<bool> {
        let current = match self.read_raw()? {
            Some(current) => current,
            // Released while we were deciding
            None => return self.try_create(tag),
        };

        let unchanged = current == observed || same_holder(&current, observed);
        if !unchanged {
            return Ok(false);
        }

        fs::write(&self.path, tag.to_yaml()?)
            .map_err(|e| GfsError::io(format!("taking over lock {}", self.path.display()), e))?;

        let previous = serde_yaml::from_str::<LockTag>(observed)
            .map(|t| t.pid.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        warn!(
            "Took over stale lock {} from pid {}",
            self.path.display(),
            previous
        );
        Ok(true)
    }
}

/// Holds a [`LockFile`] until dropped
#[derive(Debug)]
pub struct LockGuard {
    lock: LockFile,
}

impl LockGuard {
    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn same_holder(current: &str, observed: &str) -> bool {
    match (
        serde_yaml::from_str::<LockTag>(current),
        serde_yaml::from_str::<LockTag>(observed),
    ) {
        (Ok(a), Ok(b)) => a.pid == b.pid && a.hostname == b.hostname,
        _ => false,
    }
}

/// `path` with `suffix` appended to its final component
pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Time since `path` was last modified
pub(crate) fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .ok()?
        .modified()
        .ok()
        .and_then(|time| SystemTime::now().duration_since(time).ok())
}

/// Sample a normally distributed interval around `mean`
fn jitter(mean: Duration, relative_sd: f64) -> Duration {
    let mean_secs = mean.as_secs_f64();
    let sampled = Normal::new(mean_secs, mean_secs * relative_sd)
        .map(|normal| normal.sample(&mut rand::rng()))
        .unwrap_or(mean_secs);
    Duration::from_secs_f64(sampled.max(0.0)).max(MIN_INTERVAL)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn current_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn current_cmdline() -> String {
    process_cmdline(std::process::id())
        .unwrap_or_else(|| std::env::args().collect::<Vec<_>>().join(" "))
}

fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Command line of `pid` with arguments joined by spaces
fn process_cmdline(pid: u32) -> Option<String> {
    let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    Some(args.join(" "))
}

/// Unix time at which `pid` started
fn process_start_time(pid: u32) -> Option<f64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let start_ticks: f64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let boot_time: f64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // SAFETY: sysconf has no preconditions
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some(boot_time + start_ticks / ticks_per_sec as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_lock(path: PathBuf) -> LockFile {
        LockFile::new(path)
            .with_retry_interval(Duration::from_millis(20))
            .with_check_interval(Duration::from_millis(50))
    }

    fn write_tag(path: &Path, tag: &LockTag) {
        fs::write(path, serde_yaml::to_string(tag).unwrap()).unwrap();
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(dir.path().join("entry.lock"));

        assert!(lock.acquire(None).unwrap());
        let holder = lock.holder().unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert!(holder.is_ours());

        assert!(lock.release());
        assert!(!lock.path().exists());
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let first = fast_lock(path.clone());
        let second = fast_lock(path);

        assert!(first.acquire(None).unwrap());
        let started = Instant::now();
        assert!(!second.acquire(Some(Duration::from_millis(200))).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(first.release());
    }

    #[test]
    fn guard_form_reports_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let _held = fast_lock(path.clone()).lock(None).unwrap();

        let err = fast_lock(path)
            .lock(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, GfsError::LockTimeout { .. }));
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        {
            let guard = fast_lock(path.clone()).lock(None).unwrap();
            assert!(guard.path().exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn for_target_appends_suffix() {
        let lock = LockFile::for_target(Path::new("/cache/abc"));
        assert_eq!(lock.path(), Path::new("/cache/abc.lock"));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(LockTag::current().is_alive());
    }

    #[test]
    fn tag_older_than_process_start_is_dead() {
        let mut tag = LockTag::current();
        tag.time = 0.0;
        assert!(!tag.is_alive());
    }

    #[test]
    fn foreign_cmdline_is_dead() {
        let mut tag = LockTag::current();
        tag.cmdline = "definitely-not-this-process --flag".to_string();
        assert!(!tag.is_alive());
    }

    #[test]
    fn other_host_is_assumed_alive() {
        let mut tag = LockTag::current();
        tag.hostname = "some-other-host.invalid".to_string();
        tag.time = 0.0;
        assert!(tag.is_alive());
    }

    #[test]
    fn dead_holder_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let mut stale = LockTag::current();
        stale.time = 0.0;
        write_tag(&path, &stale);

        let lock = fast_lock(path.clone());
        assert!(lock.acquire(Some(Duration::from_secs(2))).unwrap());

        let holder = lock.holder().unwrap();
        assert!(holder.time > 0.0);
        assert!(!append_suffix(&path, ".remover").exists());
        assert!(lock.release());
    }

    #[cfg(unix)]
    #[test]
    fn exited_holder_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let exited = LockTag {
            pid: child.id(),
            cmdline: "true".to_string(),
            time: unix_now(),
            hostname: current_hostname(),
        };
        child.wait().unwrap();
        assert!(!exited.is_alive());
        write_tag(&path, &exited);

        let lock = fast_lock(path.clone());
        let started = Instant::now();
        assert!(lock.acquire(Some(Duration::from_secs(2))).unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(lock.holder().unwrap().is_ours());
        assert!(lock.release());
    }

    #[test]
    fn live_foreign_holder_is_not_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let mut remote = LockTag::current();
        remote.hostname = "some-other-host.invalid".to_string();
        write_tag(&path, &remote);

        let lock = fast_lock(path.clone());
        assert!(!lock.acquire(Some(Duration::from_millis(200))).unwrap());
        assert_eq!(lock.holder().unwrap().hostname, remote.hostname);
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let mut remote = LockTag::current();
        remote.pid = remote.pid.wrapping_add(1);
        write_tag(&path, &remote);

        assert!(!fast_lock(path.clone()).release());
        assert!(path.exists());
    }

    #[test]
    fn abandoned_empty_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let file = fs::File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(file);

        let lock = fast_lock(path);
        assert!(lock.acquire(Some(Duration::from_secs(2))).unwrap());
        assert!(lock.holder().unwrap().is_ours());
    }

    #[test]
    fn jitter_stays_positive() {
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(20), 0.4) >= MIN_INTERVAL);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn start_time_of_self_is_in_the_past() {
        let started = process_start_time(std::process::id()).unwrap();
        assert!(started <= unix_now() + START_TIME_SLACK_SECS);
    }
}
