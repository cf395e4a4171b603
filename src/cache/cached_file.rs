//! Seekable read-only stream over a cached block file

use crate::cache::block_file::{Block, CachedBlockFile};
use crate::error::{GfsError, GfsResult};
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Read-only stream that materializes blocks on demand.
///
/// Only the most recently used block is kept in memory.
pub struct CachedFile {
    blocks: Arc<CachedBlockFile>,
    size: u64,
    pos: u64,
    buffer: Option<Block>,
    closed: bool,
}

impl CachedFile {
    /// Open a stream over `blocks`, resolving the content length
    pub fn new(blocks: Arc<CachedBlockFile>) -> GfsResult<Self> {
        let size = blocks.size()?;
        Ok(Self {
            blocks,
            size,
            pos: 0,
            buffer: None,
            closed: false,
        })
    }

    /// Content length
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current position
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Source URL
    pub fn url(&self) -> String {
        self.blocks.meta().url
    }

    /// Underlying block store
    pub fn blocks(&self) -> &Arc<CachedBlockFile> {
        &self.blocks
    }

    /// Drop the buffered block; further reads fail
    pub fn close(&mut self) {
        self.buffer = None;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read up to `buf.len()` bytes without crossing a block boundary
    pub fn read1(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }

    /// Bytes available at the current position without advancing, at most `n`
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let available = self.fill_buf()?;
        Ok(&available[..n.min(available.len())])
    }

    /// Read `len` bytes, or everything up to the end when `len` is `None`
    pub fn read_bytes(&mut self, len: Option<usize>) -> io::Result<Vec<u8>> {
        let remaining = (self.size - self.pos.min(self.size)) as usize;
        let want = len.map_or(remaining, |len| len.min(remaining));
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let available = self.fill_buf()?;
            if available.is_empty() {
                break;
            }
            let n = available.len().min(want - out.len());
            out.extend_from_slice(&available[..n]);
            self.consume(n);
        }
        Ok(out)
    }

    /// Make the block holding `offset` the current buffer.
    ///
    /// Returns `false` at end of file.
    fn ensure_buffer(&mut self, offset: u64) -> GfsResult<bool> {
        if self.closed {
            return Err(GfsError::Internal("read from a closed file".to_string()));
        }
        if offset >= self.size {
            return Ok(false);
        }
        if self.buffer.as_ref().is_some_and(|b| b.contains(offset)) {
            return Ok(true);
        }

        let block_size = self.blocks.meta().block_size;
        let block = self.blocks.read_block(offset - offset % block_size)?;
        if !block.contains(offset) {
            return Err(GfsError::io(
                format!("reading {}", self.url()),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended before offset {} of {}", offset, self.size),
                ),
            ));
        }
        self.buffer = Some(block);
        Ok(true)
    }
}

impl BufRead for CachedFile {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if !self.ensure_buffer(self.pos)? {
            return Ok(&[]);
        }
        let limit = (self.size - self.pos) as usize;
        match &self.buffer {
            Some(block) => {
                let bytes = block.bytes_from(self.pos);
                Ok(&bytes[..bytes.len().min(limit)])
            }
            None => Ok(&[]),
        }
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt as u64).min(self.size);
    }
}

impl Read for CachedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read1(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl Seek for CachedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.size) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if target < 0 || target > i128::from(self.size) {
            return Err(GfsError::SeekOutOfRange {
                offset: target,
                size: self.size,
            }
            .into());
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile")
            .field("path", &self.blocks.path())
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}
