//! Buffered Reader
//!
//! Read-ahead reader over one object version.
//!
//! # Design
//!
//! - The read-ahead buffer is a cache slot, not state: it may be evicted at
//!   any time and is rebuilt lazily from the tracked logical offset.
//! - A seek landing inside the buffered window only moves the logical
//!   offset; anything else repositions the descriptor and empties the window.
//! - Every call takes the handle's shared lock first and the reader's own
//!   lock second. A reader whose handle version moved on closes itself.

use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::fs::BoxedFile;
use super::handle::FileHandle;
use crate::error::{Error, Result};

/// Smallest read-ahead buffer handed out
pub const MIN_READ_BUFFER: usize = 16;

/// Read-ahead window over `[base, base + filled)` of the object
struct ReadBuffer {
    data: Vec<u8>,
    base: u64,
    filled: usize,
}

impl ReadBuffer {
    fn new(capacity: usize, base: u64) -> Self {
        Self {
            data: vec![0; capacity],
            base,
            filled: 0,
        }
    }

    fn end(&self) -> u64 {
        self.base + self.filled as u64
    }

    /// Buffered bytes from `offset` on, if `offset` lies inside the window
    fn available_from(&self, offset: u64) -> Option<&[u8]> {
        if offset >= self.base && offset < self.end() {
            let start = (offset - self.base) as usize;
            Some(&self.data[start..self.filled])
        } else {
            None
        }
    }

    /// Whether a seek to `offset` can be served by the window (end inclusive)
    fn covers(&self, offset: u64) -> bool {
        offset >= self.base && offset <= self.end()
    }

    fn reset(&mut self, base: u64) {
        self.base = base;
        self.filled = 0;
    }
}

struct ReaderState {
    fd: Option<BoxedFile>,
    /// Evictable cache
    buffer: Option<ReadBuffer>,
    /// Position as seen by the caller
    offset: u64,
    /// Position of the descriptor
    fd_pos: u64,
}

#[derive(Debug, Default)]
struct ReaderCounters {
    buffer_hits: AtomicU64,
    refills: AtomicU64,
    rebuilds: AtomicU64,
    buffer_seeks: AtomicU64,
    descriptor_seeks: AtomicU64,
}

/// Reader statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Reads served entirely from the buffer
    pub buffer_hits: u64,
    /// Buffer refills from the descriptor
    pub refills: u64,
    /// Buffers re-created after eviction
    pub rebuilds: u64,
    /// Seeks satisfied inside the buffered window
    pub buffer_seeks: u64,
    /// Seeks that repositioned the descriptor
    pub descriptor_seeks: u64,
}

/// Buffered reader bound to one version of a [`FileHandle`]
pub struct FileReader {
    handle: Arc<FileHandle>,
    version: u64,
    buffer_size: usize,
    closed: AtomicBool,
    state: Mutex<ReaderState>,
    counters: ReaderCounters,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("file", &self.handle.id())
            .field("version", &self.version)
            .field("buffer_size", &self.buffer_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileReader {
    pub(crate) fn new(
        handle: Arc<FileHandle>,
        fd: BoxedFile,
        buffer_size: usize,
        version: u64,
    ) -> Self {
        let buffer_size = buffer_size.max(MIN_READ_BUFFER);
        Self {
            handle,
            version,
            buffer_size,
            closed: AtomicBool::new(false),
            state: Mutex::new(ReaderState {
                fd: Some(fd),
                buffer: Some(ReadBuffer::new(buffer_size, 0)),
                offset: 0,
                fd_pos: 0,
            }),
            counters: ReaderCounters::default(),
        }
    }

    /// Read into `buf`, returning 0 at end of file.
    ///
    /// Like a buffered reader, a single call may return fewer bytes than
    /// requested even before end of file.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_usable().await?;
        let _shared = self.handle.lock().read().await;
        // a writer may have slipped in while we waited for the lock
        self.ensure_usable().await?;

        let mut state = self.state.lock().await;
        let ReaderState {
            fd,
            buffer,
            offset,
            fd_pos,
        } = &mut *state;
        let fd = fd.as_mut().ok_or(Error::Closed("reader"))?;

        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(available) = buffer.as_ref().and_then(|b| b.available_from(*offset)) {
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            *offset += n as u64;
            self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(n);
        }

        // underrun: the descriptor must sit at the logical offset
        if *fd_pos != *offset {
            *fd_pos = fd.seek(SeekFrom::Start(*offset)).await?;
            self.counters.descriptor_seeks.fetch_add(1, Ordering::Relaxed);
        }

        // large reads bypass the buffer
        if buf.len() >= self.buffer_size {
            let n = fd.read(buf).await?;
            *fd_pos += n as u64;
            *offset += n as u64;
            if let Some(b) = buffer.as_mut() {
                b.reset(*offset);
            }
            return Ok(n);
        }

        if buffer.is_none() {
            self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
        }
        let b = buffer.get_or_insert_with(|| ReadBuffer::new(self.buffer_size, *offset));
        let filled = fd.read(&mut b.data).await?;
        b.base = *offset;
        b.filled = filled;
        *fd_pos += filled as u64;
        self.counters.refills.fetch_add(1, Ordering::Relaxed);

        let n = filled.min(buf.len());
        buf[..n].copy_from_slice(&b.data[..n]);
        *offset += n as u64;
        Ok(n)
    }

    /// Reposition the reader, returning the new absolute offset
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.ensure_usable().await?;
        let _shared = self.handle.lock().read().await;
        self.ensure_usable().await?;

        let mut state = self.state.lock().await;
        let ReaderState {
            fd,
            buffer,
            offset,
            fd_pos,
        } = &mut *state;
        let fd = fd.as_mut().ok_or(Error::Closed("reader"))?;

        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(delta) => *offset as i128 + delta as i128,
            SeekFrom::End(delta) => fd.len().await? as i128 + delta as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
            .into());
        }
        let target = target as u64;

        if buffer.as_ref().is_some_and(|b| b.covers(target)) {
            *offset = target;
            self.counters.buffer_seeks.fetch_add(1, Ordering::Relaxed);
            return Ok(target);
        }

        *fd_pos = fd.seek(SeekFrom::Start(target)).await?;
        *offset = target;
        if let Some(b) = buffer.as_mut() {
            b.reset(target);
        }
        self.counters.descriptor_seeks.fetch_add(1, Ordering::Relaxed);
        Ok(target)
    }

    /// Read from the current position to end of file
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0u8; self.buffer_size];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Length of the object version this reader sees
    pub async fn len(&self) -> Result<u64> {
        self.ensure_usable().await?;
        let _shared = self.handle.lock().read().await;
        let state = self.state.lock().await;
        match state.fd.as_ref() {
            Some(fd) => Ok(fd.len().await?),
            None => Err(Error::Closed("reader")),
        }
    }

    /// Logical position
    pub async fn position(&self) -> u64 {
        self.state.lock().await.offset
    }

    /// Drop the read-ahead buffer if the reader is idle.
    ///
    /// Returns false when a call is in flight and the buffer was kept.
    pub fn evict_buffer(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => {
                state.buffer = None;
                true
            }
            Err(_) => false,
        }
    }

    /// Close the descriptor and drop the buffer. Fails if already closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("reader"));
        }

        let mut state = self.state.lock().await;
        state.buffer = None;
        if let Some(mut fd) = state.fd.take() {
            fd.close().await?;
        }
        Ok(())
    }

    /// Closed explicitly, through the handle, or by a newer writer
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.is_closed() || self.is_stale()
    }

    pub fn is_stale(&self) -> bool {
        self.handle.version() != self.version
    }

    pub fn handle(&self) -> &Arc<FileHandle> {
        &self.handle
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            buffer_hits: self.counters.buffer_hits.load(Ordering::Relaxed),
            refills: self.counters.refills.load(Ordering::Relaxed),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            buffer_seeks: self.counters.buffer_seeks.load(Ordering::Relaxed),
            descriptor_seeks: self.counters.descriptor_seeks.load(Ordering::Relaxed),
        }
    }

    async fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.handle.is_closed() {
            return Err(Error::Closed("reader"));
        }
        if self.is_stale() {
            debug!(
                file = %self.handle.id(),
                version = self.version,
                current = self.handle.version(),
                "Stale reader closed"
            );
            let _ = self.close().await;
            return Err(Error::Closed("reader"));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
