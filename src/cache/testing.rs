//! Test doubles shared by the cache tests

use crate::cache::block_file::{BlockReader, BlockSpan};
use crate::cache::lockfile::LockSettings;
use crate::error::{GfsError, GfsResult};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Lock timings short enough for tests
pub fn fast_locks() -> LockSettings {
    LockSettings {
        timeout: Some(Duration::from_secs(10)),
        retry_interval: Duration::from_millis(20),
        check_interval: Duration::from_millis(100),
    }
}

/// Reader serving an in-memory buffer and counting fetches
pub struct MemoryReader {
    data: Vec<u8>,
    blocks: bool,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    spans: Mutex<Vec<BlockSpan>>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>, blocks: bool) -> Self {
        Self {
            data,
            blocks,
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// Sleep inside every fetch to widen race windows
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Write a partial file, then fail
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<BlockSpan> {
        self.spans.lock().unwrap().clone()
    }
}

impl BlockReader for MemoryReader {
    fn support_blocks(&self) -> bool {
        self.blocks
    }

    fn read_block(&self, dest: &Path, span: BlockSpan) -> GfsResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.spans.lock().unwrap().push(span);
        thread::sleep(self.delay);

        if self.fail {
            fs::write(dest, b"partial").unwrap();
            return Err(GfsError::backend("memory", "connection reset"));
        }

        let bytes = match span {
            BlockSpan::Whole => &self.data[..],
            BlockSpan::Range { offset, size } => {
                let start = (offset as usize).min(self.data.len());
                let end = (start + size as usize).min(self.data.len());
                &self.data[start..end]
            }
        };
        fs::write(dest, bytes).unwrap();
        Ok(bytes.len() as u64)
    }
}
