//! Filesystem Seam
//!
//! Every OS touch made by the storage engine goes through [`FileSystem`] and
//! [`FsFile`]. [`LocalFileSystem`] talks to the real disk through `tokio::fs`;
//! [`InMemoryFileSystem`] keeps objects in RAM for tests.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// An open descriptor handed out by a [`FileSystem`].
#[async_trait]
pub trait FsFile: Send + Sync {
    /// Read at the current position, returning 0 at end of file
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer at the current position
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Reposition the descriptor, returning the new absolute offset
    async fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Current length of the backing object
    async fn len(&self) -> io::Result<u64>;

    /// Flush pending writes and release the descriptor
    async fn close(&mut self) -> io::Result<()>;
}

/// Boxed descriptor
pub type BoxedFile = Box<dyn FsFile>;

/// Result of listing the storage root.
///
/// Per-entry failures are collected rather than aborting the listing.
#[derive(Debug, Default)]
pub struct DirListing {
    /// Regular files: name -> size in bytes
    pub entries: HashMap<String, u64>,
    /// Entries that could not be inspected
    pub errors: Vec<io::Error>,
}

/// Local hierarchical filesystem used by the storage engine
#[async_trait]
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    /// Open an existing object for reading
    async fn open_for_read(&self, path: &Path) -> io::Result<BoxedFile>;

    /// Open an object for writing, creating it if missing and truncating it otherwise
    async fn open_or_create_for_write(&self, path: &Path) -> io::Result<BoxedFile>;

    /// Size of an object in bytes
    async fn stat(&self, path: &Path) -> io::Result<u64>;

    /// Remove an object
    async fn delete(&self, path: &Path) -> io::Result<()>;

    /// List regular files directly under `path` (directories are skipped)
    async fn list_dir(&self, path: &Path) -> io::Result<DirListing>;
}

// =============================================================================
// Local Disk
// =============================================================================

/// [`FileSystem`] backed by the local drive
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

struct LocalFile {
    file: Option<tokio::fs::File>,
}

impl LocalFile {
    fn new(file: tokio::fs::File) -> Self {
        Self { file: Some(file) }
    }

    fn inner(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "descriptor already closed"))
    }
}

#[async_trait]
impl FsFile for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner()?.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner()?.write_all(buf).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner()?.seek(pos).await
    }

    async fn len(&self) -> io::Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata().await?.len()),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "descriptor already closed",
            )),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            // tokio completes writes in the background; flush before dropping
            file.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn open_for_read(&self, path: &Path) -> io::Result<BoxedFile> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(LocalFile::new(file)))
    }

    async fn open_or_create_for_write(&self, path: &Path) -> io::Result<BoxedFile> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Box::new(LocalFile::new(file)))
    }

    async fn stat(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn list_dir(&self, path: &Path) -> io::Result<DirListing> {
        let mut dir = tokio::fs::read_dir(path).await?;
        let mut listing = DirListing::default();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    listing.errors.push(e);
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }

            match entry.file_name().into_string() {
                Ok(name) => {
                    listing.entries.insert(name, metadata.len());
                }
                Err(name) => listing.errors.push(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non UTF-8 file name: {:?}", name),
                )),
            }
        }

        Ok(listing)
    }
}

// =============================================================================
// In-Memory (testing)
// =============================================================================

type SharedBytes = Arc<Mutex<Vec<u8>>>;

/// In-memory [`FileSystem`] for tests.
///
/// Objects live in a flat map keyed by full path. Writers truncate on open
/// exactly like the local implementation.
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    objects: Mutex<HashMap<PathBuf, SharedBytes>>,
    dirs: Mutex<Vec<PathBuf>>,
    fail_open_for_write: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object with content
    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .insert(path.into(), Arc::new(Mutex::new(data.into())));
    }

    /// Register a sub-directory so it shows up (and gets skipped) in listings
    pub fn insert_dir(&self, path: impl Into<PathBuf>) {
        self.dirs.lock().push(path.into());
    }

    /// Snapshot of an object's content
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.objects.lock().get(path).map(|data| data.lock().clone())
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.objects.lock().contains_key(path)
    }

    /// Make every subsequent `open_or_create_for_write` fail
    pub fn set_fail_open_for_write(&self, fail: bool) {
        self.fail_open_for_write.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent descriptor write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn object(&self, path: &Path) -> io::Result<SharedBytes> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

struct MemFile {
    data: SharedBytes,
    pos: u64,
    writable: bool,
    fail_writes: bool,
    closed: bool,
}

impl MemFile {
    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "descriptor already closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FsFile for MemFile {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let data = self.data.lock();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "descriptor opened for reading",
            ));
        }
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut data = self.data.lock();
        let start = self.pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(())
    }

    async fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        let len = self.data.lock().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    async fn len(&self) -> io::Result<u64> {
        self.check_open()?;
        Ok(self.data.lock().len() as u64)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl FileSystem for InMemoryFileSystem {
    async fn open_for_read(&self, path: &Path) -> io::Result<BoxedFile> {
        Ok(Box::new(MemFile {
            data: self.object(path)?,
            pos: 0,
            writable: false,
            fail_writes: false,
            closed: false,
        }))
    }

    async fn open_or_create_for_write(&self, path: &Path) -> io::Result<BoxedFile> {
        if self.fail_open_for_write.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected open failure",
            ));
        }

        let data = {
            let mut objects = self.objects.lock();
            let data = objects
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .clone();
            data.lock().clear();
            data
        };

        Ok(Box::new(MemFile {
            data,
            pos: 0,
            writable: true,
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
            closed: false,
        }))
    }

    async fn stat(&self, path: &Path) -> io::Result<u64> {
        Ok(self.object(path)?.lock().len() as u64)
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        self.objects
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    async fn list_dir(&self, path: &Path) -> io::Result<DirListing> {
        let mut listing = DirListing::default();

        for (object_path, data) in self.objects.lock().iter() {
            if object_path.parent() != Some(path) {
                continue;
            }
            if self.dirs.lock().iter().any(|d| d == object_path) {
                continue;
            }
            if let Some(name) = object_path.file_name().and_then(|n| n.to_str()) {
                listing
                    .entries
                    .insert(name.to_string(), data.lock().len() as u64);
            }
        }

        Ok(listing)
    }
}

// =============================================================================
// Tests
// =============================================================================
