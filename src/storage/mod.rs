//! Storage Engine
//!
//! Quota-bounded object store over a flat directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     StorageController                         │
//! │        id -> FileHandle map           QuotaLedger             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FileHandle (RW lock, version, closed)                        │
//! │     ├── FileReader  (shared lock per call, read-ahead buffer) │
//! │     └── FileWriter  (exclusive lock for its lifetime)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FileSystem seam: LocalFileSystem | InMemoryFileSystem        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Objects are stored as `<root>/<uuid>` with no sidecar metadata.

mod controller;
mod fs;
mod handle;
mod quota;
mod reader;
mod writer;

pub use controller::StorageController;
pub use fs::{BoxedFile, DirListing, FileSystem, FsFile, InMemoryFileSystem, LocalFileSystem};
pub use handle::FileHandle;
pub use quota::QuotaLedger;
pub use reader::{FileReader, ReaderStats, MIN_READ_BUFFER};
pub use writer::FileWriter;

/// Default lower bound for read-ahead buffers (64KiB)
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 64 * 1024;

/// Default upper bound for read-ahead buffers (5MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Read-ahead size for an object: a tenth of it, clamped to the bounds
pub fn read_buffer_size(object_size: u64, min: usize, max: usize) -> usize {
    let tenth = usize::try_from(object_size / 10).unwrap_or(usize::MAX);
    tenth.clamp(min, max.max(min))
}
