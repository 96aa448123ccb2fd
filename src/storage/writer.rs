//! Exclusive writer for one object version.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard};
use tracing::{debug, warn};

use super::fs::BoxedFile;
use super::handle::FileHandle;
use crate::error::{Error, Result};

struct WriterState {
    fd: Option<BoxedFile>,
    /// Held until close or drop
    guard: Option<OwnedRwLockWriteGuard<()>>,
    written: u64,
}

/// Sole writer of a [`FileHandle`], holding its exclusive lock.
///
/// Every write is charged to the quota ledger before it reaches the
/// descriptor, so a rejected write leaves both the object and the ledger
/// unchanged.
pub struct FileWriter {
    handle: Arc<FileHandle>,
    version: u64,
    closed: AtomicBool,
    state: Mutex<WriterState>,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("file", &self.handle.id())
            .field("version", &self.version)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileWriter {
    pub(crate) fn new(
        handle: Arc<FileHandle>,
        fd: BoxedFile,
        guard: OwnedRwLockWriteGuard<()>,
        version: u64,
    ) -> Self {
        Self {
            handle,
            version,
            closed: AtomicBool::new(false),
            state: Mutex::new(WriterState {
                fd: Some(fd),
                guard: Some(guard),
                written: 0,
            }),
        }
    }

    /// Append `buf` to the object.
    ///
    /// Fails with `QuotaExceeded` when the ledger cannot cover the bytes.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) || self.handle.is_closed() {
            return Err(Error::Closed("writer"));
        }

        let mut state = self.state.lock().await;
        let fd = state.fd.as_mut().ok_or(Error::Closed("writer"))?;

        let n = buf.len() as u64;
        self.handle.ledger().allocate(n)?;

        if let Err(e) = fd.write_all(buf).await {
            self.handle.ledger().release(n);
            warn!(file = %self.handle.id(), error = %e, "Write failed, allocation returned");
            return Err(e.into());
        }

        state.written += n;
        self.handle.add_size(n);
        Ok(buf.len())
    }

    /// Flush and release the descriptor and the exclusive lock.
    /// Fails if already closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("writer"));
        }

        let mut state = self.state.lock().await;
        let result = match state.fd.take() {
            Some(mut fd) => fd.close().await,
            None => Ok(()),
        };
        // the lock goes even when the flush failed
        state.guard.take();

        debug!(
            file = %self.handle.id(),
            version = self.version,
            written = state.written,
            "Writer closed"
        );
        result.map_err(Error::from)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.is_closed()
    }

    pub fn handle(&self) -> &Arc<FileHandle> {
        &self.handle
    }

    /// Version this writer produces
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bytes accepted so far
    pub async fn written(&self) -> u64 {
        self.state.lock().await.written
    }
}

// =============================================================================
// Tests
// =============================================================================
