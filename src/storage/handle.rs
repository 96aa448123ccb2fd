//! File Handle
//!
//! Per-object state shared by every reader and writer of one object.
//!
//! # Locking
//!
//! Each handle owns one async read/write lock. Readers take the shared side
//! for the duration of a single `read`/`seek` call; a [`FileWriter`] takes the
//! exclusive side when it is created and keeps it until it is closed or
//! dropped. Creating a writer bumps `version`, which permanently invalidates
//! every reader opened before it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::fs::FileSystem;
use super::quota::QuotaLedger;
use super::reader::FileReader;
use super::writer::FileWriter;
use crate::error::{Error, Result};

/// Versioned handle on one stored object
#[derive(Debug)]
pub struct FileHandle {
    id: Uuid,
    dir: PathBuf,
    /// Bytes charged to the ledger for this object
    size: AtomicU64,
    version: AtomicU64,
    closed: AtomicBool,
    lock: Arc<RwLock<()>>,
    ledger: Arc<QuotaLedger>,
    fs: Arc<dyn FileSystem>,
}

impl FileHandle {
    pub(crate) fn new(
        id: Uuid,
        dir: PathBuf,
        size: u64,
        ledger: Arc<QuotaLedger>,
        fs: Arc<dyn FileSystem>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            dir,
            size: AtomicU64::new(size),
            version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            lock: Arc::new(RwLock::new(())),
            ledger,
            fs,
        })
    }

    /// Open a buffered reader bound to the current version
    pub async fn reader(self: &Arc<Self>, buffer_size: usize) -> Result<FileReader> {
        if self.is_closed() {
            return Err(Error::Closed("file"));
        }

        let _shared = self.lock.read().await;
        let version = self.version();
        let fd = self.fs.open_for_read(&self.full_path()).await?;

        Ok(FileReader::new(Arc::clone(self), fd, buffer_size, version))
    }

    /// Open the single writer of this object.
    ///
    /// Waits until every in-flight read and any previous writer are done,
    /// then truncates the object, bumps the version and returns the
    /// committed size to the ledger. Bytes are charged again as the writer
    /// receives them. If the truncating open fails nothing changes.
    pub async fn writer(self: &Arc<Self>) -> Result<FileWriter> {
        if self.is_closed() {
            return Err(Error::Closed("file"));
        }

        let exclusive = Arc::clone(&self.lock).write_owned().await;
        if self.is_closed() {
            return Err(Error::Closed("file"));
        }

        // Readers stay on the current version until the truncating open
        // succeeds; a failed open leaves them usable.
        let fd = self.fs.open_or_create_for_write(&self.full_path()).await?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        let previous = self.size.swap(0, Ordering::AcqRel);
        self.ledger.release(previous);

        debug!(file = %self.id, version, released = previous, "Writer opened");

        Ok(FileWriter::new(Arc::clone(self), fd, exclusive, version))
    }

    /// Mark the handle closed. Fails if it already was.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("file"));
        }
        Ok(())
    }

    /// Close the handle and remove the backing object.
    ///
    /// Waits for in-flight I/O to drain, then returns the object's committed
    /// bytes to the ledger.
    pub async fn delete(&self) -> Result<()> {
        self.close()?;

        let _exclusive = self.lock.write().await;
        let size = self.size.swap(0, Ordering::AcqRel);
        self.ledger.release(size);

        self.fs.delete(&self.full_path()).await?;
        debug!(file = %self.id, released = size, "Object deleted");
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Directory holding the object
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the backing object, named by the canonical id string
    pub fn full_path(&self) -> PathBuf {
        self.dir.join(self.id.to_string())
    }

    /// Committed size; only authoritative while no writer is open
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    pub(crate) fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub(crate) fn add_size(&self, n: u64) {
        self.size.fetch_add(n, Ordering::AcqRel);
    }
}

// =============================================================================
// Tests
// =============================================================================
