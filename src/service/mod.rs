//! File Service
//!
//! Use cases on top of the storage controller and the two connection
//! pools.
//!
//! ```text
//!  lifecycle (origin)                       direct (client)
//!  ───────────────────                      ────────────────────────
//!  create_file / update_file ─► writers ◄── write_by_connection
//!  open_file                 ─► readers ◄── read_by_connection
//!  delete_file                          ◄── close_by_connection
//! ```
//!
//! A failed write leaves a partial object behind. It is compensated by
//! telling the origin to forget the object and deleting it locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connector::{Closable, Connector, DisposalConfig, DisposalTask};
use crate::domain::ports::OriginNotifier;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{
    read_buffer_size, FileHandle, FileReader, FileWriter, StorageController,
    DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MIN_BUFFER_SIZE,
};

/// Largest chunk moved per read of an upload body
const COPY_CHUNK: usize = 64 * 1024;

/// Use-case configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Lower bound for reader buffers
    pub min_buffer_size: usize,
    /// Upper bound for reader buffers
    pub max_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

// =============================================================================
// Pooled values
// =============================================================================

/// An object opened for writing on behalf of an origin host.
///
/// The writer itself is only created when bytes arrive, so an idle pending
/// write does not hold the handle's exclusive lock.
#[derive(Debug)]
pub struct PendingWrite {
    handle: Arc<FileHandle>,
    host: String,
    closed: AtomicBool,
}

impl PendingWrite {
    pub fn new(handle: Arc<FileHandle>, host: impl Into<String>) -> Self {
        Self {
            handle,
            host: host.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Arc<FileHandle> {
        &self.handle
    }

    /// Origin host to notify if the write fails
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Closable for PendingWrite {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.is_closed()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("connection"));
        }
        Ok(())
    }
}

#[async_trait]
impl Closable for FileReader {
    fn is_closed(&self) -> bool {
        FileReader::is_closed(self)
    }

    async fn close(&self) -> Result<()> {
        FileReader::close(self).await
    }

    fn trim(&self) {
        self.evict_buffer();
    }
}

// =============================================================================
// Service
// =============================================================================

/// Entry point for every transport
pub struct FileService {
    controller: Arc<StorageController>,
    writers: Arc<Connector<PendingWrite>>,
    readers: Arc<Connector<FileReader>>,
    notifier: Arc<dyn OriginNotifier>,
    config: ServiceConfig,
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("controller", &self.controller)
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .field("config", &self.config)
            .finish()
    }
}

impl FileService {
    pub fn new(
        controller: Arc<StorageController>,
        notifier: Arc<dyn OriginNotifier>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            controller,
            writers: Arc::new(Connector::new("writers")),
            readers: Arc::new(Connector::new("readers")),
            notifier,
            config,
        }
    }

    /// Start the disposal sweeps of both pools
    pub fn start_disposal(&self, config: DisposalConfig) -> [DisposalTask; 2] {
        info!(
            interval_secs = config.interval.as_secs(),
            keep_alive_secs = config.keep_alive.as_secs(),
            "Starting connection disposal"
        );
        [
            self.writers.start_disposal(config.clone()),
            self.readers.start_disposal(config),
        ]
    }

    pub fn controller(&self) -> &Arc<StorageController> {
        &self.controller
    }

    pub fn writers(&self) -> &Arc<Connector<PendingWrite>> {
        &self.writers
    }

    pub fn readers(&self) -> &Arc<Connector<FileReader>> {
        &self.readers
    }

    // ===== Lifecycle =====

    /// Register a new object and open a write connection for `host`
    #[instrument(skip(self))]
    pub async fn create_file(&self, host: &str, id: Uuid) -> Result<Uuid> {
        let handle = self.controller.add_file(id).await?;
        Ok(self.writers.open_connection(PendingWrite::new(handle, host)))
    }

    /// Open a write connection that will replace an existing object
    #[instrument(skip(self))]
    pub async fn update_file(&self, host: &str, id: Uuid) -> Result<Uuid> {
        let handle = self.controller.file(id)?;
        Ok(self.writers.open_connection(PendingWrite::new(handle, host)))
    }

    /// Open a read connection with a buffer sized to the object
    #[instrument(skip(self))]
    pub async fn open_file(&self, id: Uuid) -> Result<Uuid> {
        let handle = self.controller.file(id)?;
        let buffer = read_buffer_size(
            handle.size(),
            self.config.min_buffer_size,
            self.config.max_buffer_size,
        );
        let reader = handle.reader(buffer).await?;
        Ok(self.readers.open_connection(reader))
    }

    #[instrument(skip(self))]
    pub async fn delete_file(&self, id: Uuid) -> Result<()> {
        self.controller.delete_file(id).await
    }

    // ===== Direct transfers =====

    /// Reader behind a read connection
    pub fn read_by_connection(&self, connection: Uuid) -> Result<Arc<FileReader>> {
        let reader = self.readers.connection(connection)?;
        if reader.is_closed() {
            return Err(Error::Closed("connection"));
        }
        Ok(reader)
    }

    /// Replace the object behind a write connection with exactly
    /// `expected_size` bytes from `body`.
    ///
    /// Any failure once the object was truncated (short body, quota, I/O,
    /// cancellation) triggers compensation before the error is returned.
    #[instrument(skip(self, body, cancel))]
    pub async fn write_by_connection<R>(
        &self,
        connection: Uuid,
        body: R,
        expected_size: u64,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let pending = self.writers.connection(connection)?;
        if pending.is_closed() {
            return Err(Error::Closed("connection"));
        }

        let writer = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            writer = pending.handle().writer() => writer?,
        };

        let copied = if expected_size == 0 {
            Err(Error::InvalidRequest("request is empty".into()))
        } else {
            copy_exact(&writer, body, expected_size, cancel).await
        };
        let closed = writer.close().await;
        let result = copied.and_then(|n| closed.map(|_| n));

        match result {
            Ok(n) => {
                debug!(file = %pending.handle().id(), bytes = n, "Upload complete");
                Ok(n)
            }
            Err(e) => {
                warn!(file = %pending.handle().id(), error = %e, "Upload failed, compensating");
                self.compensate_write(connection, pending).await;
                Err(e)
            }
        }
    }

    /// Close a read or write connection
    #[instrument(skip(self))]
    pub async fn close_by_connection(&self, connection: Uuid) -> Result<()> {
        match self.readers.close_connection(connection).await {
            Err(Error::NotFound(_)) => self.writers.close_connection(connection).await,
            other => other,
        }
    }

    /// Undo a failed upload. Best-effort: failures are logged, not retried.
    ///
    /// Runs as its own task so a caller that goes away mid-way (client
    /// disconnect) cannot cut it short.
    async fn compensate_write(&self, connection: Uuid, pending: Arc<PendingWrite>) {
        metrics::COMPENSATIONS.inc();
        self.writers.remove(connection);

        let controller = Arc::clone(&self.controller);
        let notifier = Arc::clone(&self.notifier);
        let task = tokio::spawn(async move {
            let id = pending.handle().id();
            let mut errors = Vec::new();

            if !pending.host().is_empty() {
                if let Err(e) = notifier.object_failed(pending.host(), id).await {
                    errors.push(e);
                }
            }
            if let Err(e) = controller.delete_file(id).await {
                errors.push(e);
            }
            let _ = pending.close().await;

            match Error::aggregate(errors) {
                Some(err) => error!(file = %id, error = %err, "Compensation incomplete"),
                None => info!(file = %id, "Failed upload compensated"),
            }
        });

        if let Err(e) = task.await {
            error!(error = %e, "Compensation task panicked");
        }
    }
}

/// Move exactly `expected` bytes from `body` into `writer`
async fn copy_exact<R>(
    writer: &FileWriter,
    mut body: R,
    expected: u64,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_CHUNK.min(expected as usize)];
    let mut written = 0u64;

    while written < expected {
        let want = buf.len().min((expected - written) as usize);
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            n = body.read(&mut buf[..want]) => n?,
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("body ended after {} of {} bytes", written, expected),
            )
            .into());
        }
        writer.write(&buf[..n]).await?;
        written += n as u64;
    }

    Ok(written)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingOrigin;
    use crate::storage::InMemoryFileSystem;
    use assert_matches::assert_matches;
    use std::io::SeekFrom;
    use std::path::Path;
    use tokio::io::AsyncWriteExt;

    const ROOT: &str = "/store";
    const HOST: &str = "http://origin";

    struct Fixture {
        service: FileService,
        fs: Arc<InMemoryFileSystem>,
        origin: Arc<RecordingOrigin>,
    }

    async fn fixture(max: u64) -> Fixture {
        fixture_with(max, &[], ServiceConfig {
            min_buffer_size: 16,
            max_buffer_size: 64,
        })
        .await
    }

    async fn fixture_with(max: u64, seed: &[(Uuid, &[u8])], config: ServiceConfig) -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        for (id, content) in seed {
            fs.insert(object_path(*id), content.to_vec());
        }
        let controller = StorageController::open(ROOT, max, fs.clone()).await.unwrap();
        let origin = Arc::new(RecordingOrigin::new());
        let service = FileService::new(Arc::new(controller), origin.clone(), config);
        Fixture {
            service,
            fs,
            origin,
        }
    }

    fn object_path(id: Uuid) -> std::path::PathBuf {
        Path::new(ROOT).join(id.to_string())
    }

    async fn read_all(service: &FileService, id: Uuid) -> Vec<u8> {
        let conn = service.open_file(id).await.unwrap();
        let reader = service.read_by_connection(conn).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        service.close_by_connection(conn).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_create_write_open_read() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();

        let conn = f.service.create_file(HOST, id).await.unwrap();
        let body = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"and welcome")
            .build();
        let n = f
            .service
            .write_by_connection(conn, body, 17, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 17);
        assert_eq!(f.service.controller().ledger().current(), 17);

        assert_eq!(read_all(&f.service, id).await, b"hello and welcome");
        assert!(f.origin.failed_objects().is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        f.service.create_file(HOST, id).await.unwrap();
        assert_matches!(
            f.service.create_file(HOST, id).await,
            Err(Error::AlreadyExists(_))
        );
    }

    #[tokio::test]
    async fn test_update_replaces_content_and_locks_out_readers() {
        let id = Uuid::new_v4();
        let f = fixture_with(1024, &[(id, &b"original"[..])], ServiceConfig::default()).await;
        assert_eq!(f.service.controller().ledger().current(), 8);

        let read_conn = f.service.open_file(id).await.unwrap();
        let reader = f.service.read_by_connection(read_conn).unwrap();

        let conn = f.service.update_file(HOST, id).await.unwrap();
        let body = tokio_test::io::Builder::new().read(b"new").build();
        f.service
            .write_by_connection(conn, body, 3, &CancellationToken::new())
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert_matches!(reader.read(&mut buf).await, Err(Error::Closed(_)));
        assert_matches!(
            f.service.read_by_connection(read_conn),
            Err(Error::Closed(_))
        );
        assert_eq!(read_all(&f.service, id).await, b"new");
        assert_eq!(f.service.controller().ledger().current(), 3);
    }

    #[tokio::test]
    async fn test_update_missing_file() {
        let f = fixture(1024).await;
        assert_matches!(
            f.service.update_file(HOST, Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        );
        assert_matches!(
            f.service.open_file(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_short_body_compensates() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let body = tokio_test::io::Builder::new().read(b"abc").build();
        assert_matches!(
            f.service
                .write_by_connection(conn, body, 10, &CancellationToken::new())
                .await,
            Err(Error::Io(_))
        );

        assert_eq!(f.origin.failed_objects(), vec![(HOST.to_string(), id)]);
        assert!(!f.service.controller().contains(id));
        assert!(!f.fs.exists(&object_path(id)));
        assert_eq!(f.service.controller().ledger().current(), 0);
        assert!(!f.service.writers().contains(conn));
    }

    #[tokio::test]
    async fn test_empty_body_compensates() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        assert_matches!(
            f.service
                .write_by_connection(conn, tokio::io::empty(), 0, &CancellationToken::new())
                .await,
            Err(Error::InvalidRequest(_))
        );
        assert_eq!(f.origin.failed_objects().len(), 1);
        assert!(!f.service.controller().contains(id));
    }

    #[tokio::test]
    async fn test_quota_exceeded_mid_upload_compensates() {
        let f = fixture(8).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let body = tokio_test::io::Builder::new()
            .read(b"12345")
            .read(b"67890")
            .build();
        assert_matches!(
            f.service
                .write_by_connection(conn, body, 10, &CancellationToken::new())
                .await,
            Err(Error::QuotaExceeded { .. })
        );
        assert!(!f.service.controller().contains(id));
        assert_eq!(f.service.controller().ledger().current(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_compensates() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let (mut client, body) = tokio::io::duplex(64);
        client.write_all(b"partial").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert_matches!(
            f.service.write_by_connection(conn, body, 100, &cancel).await,
            Err(Error::Cancelled)
        );
        assert_eq!(f.origin.failed_objects(), vec![(HOST.to_string(), id)]);
        assert!(!f.service.controller().contains(id));
        drop(client);
    }

    #[tokio::test]
    async fn test_compensation_continues_when_origin_unreachable() {
        let f = fixture(1024).await;
        f.origin.set_fail_notifications(true);
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();

        let body = tokio_test::io::Builder::new().read(b"x").build();
        assert!(f
            .service
            .write_by_connection(conn, body, 2, &CancellationToken::new())
            .await
            .is_err());
        assert!(!f.service.controller().contains(id));
    }

    #[tokio::test]
    async fn test_read_connection_seek() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        let conn = f.service.create_file(HOST, id).await.unwrap();
        let body = tokio_test::io::Builder::new().read(b"hello and welcome").build();
        f.service
            .write_by_connection(conn, body, 17, &CancellationToken::new())
            .await
            .unwrap();

        let read_conn = f.service.open_file(id).await.unwrap();
        let reader = f.service.read_by_connection(read_conn).unwrap();
        assert_eq!(reader.buffer_size(), 16);
        reader.seek(SeekFrom::Start(10)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"welcome");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposal_trims_idle_reader_buffer() {
        let id = Uuid::new_v4();
        let f = fixture_with(
            1024,
            &[(id, &b"hello and welcome"[..])],
            ServiceConfig {
                min_buffer_size: 16,
                max_buffer_size: 64,
            },
        )
        .await;
        let conn = f.service.open_file(id).await.unwrap();
        let reader = f.service.read_by_connection(conn).unwrap();
        let mut buf = [0u8; 5];
        reader.read(&mut buf).await.unwrap();

        tokio::time::advance(std::time::Duration::from_secs(6 * 60)).await;
        let report = f
            .service
            .readers()
            .dispose(std::time::Duration::from_secs(10 * 60))
            .await;
        assert!(report.evicted.is_empty());
        assert_eq!(report.trimmed, 1);

        let mut next = [0u8; 4];
        reader.read(&mut next).await.unwrap();
        assert_eq!(&next, b" and");
        assert_eq!(reader.stats().rebuilds, 1);
    }

    #[tokio::test]
    async fn test_close_by_connection() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        let write_conn = f.service.create_file(HOST, id).await.unwrap();
        let read_conn = f.service.open_file(id).await.unwrap();

        f.service.close_by_connection(read_conn).await.unwrap();
        f.service.close_by_connection(write_conn).await.unwrap();
        assert!(f.service.readers().is_empty());
        assert!(f.service.writers().is_empty());

        assert_matches!(
            f.service.close_by_connection(read_conn).await,
            Err(Error::NotFound(_))
        );
        assert_matches!(
            f.service
                .write_by_connection(write_conn, tokio::io::empty(), 1, &CancellationToken::new())
                .await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_delete_file() {
        let f = fixture(1024).await;
        let id = Uuid::new_v4();
        f.service.create_file(HOST, id).await.unwrap();
        f.service.delete_file(id).await.unwrap();
        assert_matches!(f.service.delete_file(id).await, Err(Error::NotFound(_)));
    }
}
