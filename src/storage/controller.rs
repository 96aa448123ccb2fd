//! Storage Controller
//!
//! Registry of every object under the storage root plus the quota ledger
//! they share.
//!
//! ```text
//!                  ┌────────────────────────────┐
//!   add_file ────► │  files: id -> FileHandle   │ ──► reader()/writer()
//!   delete_file ─► │  creating: ids in flight   │
//!   file ───────►  │  ledger: current <= max    │ ◄── allocate/release
//!                  └────────────────────────────┘
//! ```
//!
//! The map is a `DashMap`, so its shard locks are only held for a single
//! lookup or insert and never while a handle lock is held.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::fs::{FileSystem, LocalFileSystem};
use super::handle::FileHandle;
use super::quota::QuotaLedger;
use crate::error::{Error, Result};

/// Owner of all file handles and the quota ledger
#[derive(Debug)]
pub struct StorageController {
    root: PathBuf,
    ledger: Arc<QuotaLedger>,
    files: DashMap<Uuid, Arc<FileHandle>>,
    /// Ids whose on-disk object is being created
    creating: Mutex<HashSet<Uuid>>,
    fs: Arc<dyn FileSystem>,
}

/// Removes an id from the in-flight set on every exit path
struct CreationGuard<'a> {
    creating: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.creating.lock().remove(&self.id);
    }
}

impl StorageController {
    /// Scan `root` and build the controller.
    ///
    /// Only regular files named by a canonical id are registered. Entries
    /// that cannot be inspected are logged and skipped; construction fails
    /// only when the registered objects already exceed `max_size`.
    #[instrument(skip(root, fs), fields(root = %root.as_ref().display()))]
    pub async fn open(
        root: impl AsRef<Path>,
        max_size: u64,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let listing = fs.list_dir(&root).await?;

        let mut skipped = 0usize;
        let mut total: u64 = 0;
        let mut known = Vec::with_capacity(listing.entries.len());
        for (name, size) in listing.entries {
            match Uuid::parse_str(&name) {
                Ok(id) if id.to_string() == name => {
                    total = total.saturating_add(size);
                    known.push((id, size));
                }
                _ => skipped += 1,
            }
        }

        if let Some(err) = Error::aggregate(listing.errors.into_iter().map(Error::from).collect())
        {
            warn!(error = %err, "Storage scan finished with errors");
        }

        if total > max_size {
            return Err(Error::QuotaExceeded {
                requested: total,
                available: max_size,
            });
        }

        let ledger = Arc::new(QuotaLedger::with_usage(max_size, total));
        let files = DashMap::with_capacity(known.len());
        for (id, size) in known {
            files.insert(
                id,
                FileHandle::new(id, root.clone(), size, Arc::clone(&ledger), Arc::clone(&fs)),
            );
        }

        info!(
            objects = files.len(),
            skipped,
            used = total,
            max = max_size,
            "Storage controller ready"
        );

        Ok(Self {
            root,
            ledger,
            files,
            creating: Mutex::new(HashSet::new()),
            fs,
        })
    }

    /// Controller over the local filesystem
    pub async fn open_local(root: impl AsRef<Path>, max_size: u64) -> Result<Self> {
        Self::open(root, max_size, Arc::new(LocalFileSystem::new())).await
    }

    // ===== Quota =====

    pub fn allocate_storage(&self, size: u64) -> Result<()> {
        self.ledger.allocate(size)
    }

    pub fn release_storage(&self, size: u64) {
        self.ledger.release(size)
    }

    pub fn allocate_all(&self) -> Result<u64> {
        self.ledger.allocate_all()
    }

    /// Fail fast when `size` more bytes would not fit right now
    pub fn has_capacity(&self, size: u64) -> Result<()> {
        self.ledger.has_capacity(size)
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    // ===== Files =====

    /// Create an empty object and register its handle
    #[instrument(skip(self))]
    pub async fn add_file(&self, id: Uuid) -> Result<Arc<FileHandle>> {
        let _guard = {
            let mut creating = self.creating.lock();
            if self.files.contains_key(&id) || !creating.insert(id) {
                return Err(Error::AlreadyExists(id.to_string()));
            }
            CreationGuard {
                creating: &self.creating,
                id,
            }
        };

        let handle = FileHandle::new(
            id,
            self.root.clone(),
            0,
            Arc::clone(&self.ledger),
            Arc::clone(&self.fs),
        );
        let mut fd = self.fs.open_or_create_for_write(&handle.full_path()).await?;
        fd.close().await?;

        self.files.insert(id, Arc::clone(&handle));
        debug!(file = %id, "Object created");
        Ok(handle)
    }

    /// Unregister the object, then remove it from disk.
    ///
    /// The entry is not restored when the on-disk delete fails.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, id: Uuid) -> Result<()> {
        let (_, handle) = self
            .files
            .remove(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        handle.delete().await
    }

    pub fn file(&self, id: Uuid) -> Result<Arc<FileHandle>> {
        self.files
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.files.contains_key(&id)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

// =============================================================================
// Tests
// =============================================================================
