//! Lifecycle Command Handler
//!
//! Executes create/update/open/delete commands from origin hosts and posts
//! the reply back to the command's host.
//!
//! ```text
//!   mpsc::Receiver<LifecycleCommand>
//!          │  one task per command
//!          ▼
//!   process ──► (reply, revert) ──► ReplySink::deliver(host)
//!                                        │
//!                    transport error or 205 Reset Content ──► revert
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::ports::{CommandKind, LifecycleCommand, LifecycleReply, ReplyAck, ReplySink};
use crate::error::{Error, Result};
use crate::metrics;
use crate::service::FileService;

/// Undo step for a command whose reply did not land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revert {
    None,
    /// Remove an object created by the command
    DeleteFile(Uuid),
    /// Close a connection opened by the command
    CloseConnection(Uuid),
}

impl Revert {
    async fn run(self, service: &FileService) -> Result<()> {
        match self {
            Revert::None => Ok(()),
            Revert::DeleteFile(id) => service.delete_file(id).await,
            Revert::CloseConnection(conn) => service.close_by_connection(conn).await,
        }
    }
}

/// Executes lifecycle commands against the file service
pub struct LifecycleHandler {
    service: Arc<FileService>,
    replies: Arc<dyn ReplySink>,
    /// Host reported in every reply
    public_host: String,
}

impl std::fmt::Debug for LifecycleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHandler")
            .field("public_host", &self.public_host)
            .finish()
    }
}

impl LifecycleHandler {
    pub fn new(
        service: Arc<FileService>,
        replies: Arc<dyn ReplySink>,
        public_host: impl Into<String>,
    ) -> Self {
        Self {
            service,
            replies,
            public_host: public_host.into(),
        }
    }

    /// Run a command without replying.
    ///
    /// Failures are folded into the reply's `err`; only a successful
    /// create or open carries a revert.
    #[instrument(skip(self, command), fields(command = %command.id, kind = %command.kind, file = %command.file_id))]
    pub async fn process(&self, command: &LifecycleCommand) -> (LifecycleReply, Revert) {
        let outcome = match command.kind {
            CommandKind::Create => self.create(command).await,
            CommandKind::Update => self.update(command).await,
            CommandKind::Open => self.open(command).await,
            CommandKind::Delete => self.delete(command).await,
        };

        match outcome {
            Ok((connection_id, revert)) => (self.reply(command, connection_id, None), revert),
            Err(e) => {
                if e.is_quota_exceeded() {
                    warn!(error = %e, "Store is full");
                } else {
                    debug!(error = %e, "Command failed");
                }
                (self.reply(command, None, Some(e.to_string())), Revert::None)
            }
        }
    }

    /// Process a command, deliver the reply and revert when it is refused
    /// or cannot be delivered.
    pub async fn handle(&self, command: LifecycleCommand) -> Result<ReplyAck> {
        let (reply, revert) = self.process(&command).await;
        let label = command.kind.to_string();
        let status = if reply.is_error() { "error" } else { "ok" };

        let delivered = self.replies.deliver(&command.host, &reply).await;
        let reverted = matches!(delivered, Ok(ReplyAck::Reset) | Err(_));
        if reverted {
            if let Err(e) = revert.run(&self.service).await {
                error!(command = %command.id, ?revert, error = %e, "Revert failed");
            } else if revert != Revert::None {
                info!(command = %command.id, ?revert, "Command reverted");
            }
        }

        metrics::COMMANDS
            .with_label_values(&[label.as_str(), if reverted { "reverted" } else { status }])
            .inc();
        delivered
    }

    /// Consume commands until the channel closes or `shutdown` fires, then
    /// wait for in-flight commands.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<LifecycleCommand>,
        shutdown: CancellationToken,
    ) {
        info!(host = %self.public_host, "Lifecycle handler started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    let handler = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let id = command.id;
                        if let Err(e) = handler.handle(command).await {
                            warn!(command = %id, error = %e, "Reply not delivered");
                        }
                    });
                }
                // reap finished tasks so the set does not grow unbounded
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!("Lifecycle handler stopped");
    }

    async fn create(&self, command: &LifecycleCommand) -> Result<(Option<Uuid>, Revert)> {
        self.service.controller().has_capacity(command.size)?;
        let conn = self
            .service
            .create_file(&command.host, command.file_id)
            .await?;
        Ok((Some(conn), Revert::DeleteFile(command.file_id)))
    }

    async fn update(&self, command: &LifecycleCommand) -> Result<(Option<Uuid>, Revert)> {
        self.service.controller().has_capacity(command.size)?;
        self.service.controller().file(command.file_id)?;
        let conn = self
            .service
            .update_file(&command.host, command.file_id)
            .await?;
        Ok((Some(conn), Revert::None))
    }

    async fn open(&self, command: &LifecycleCommand) -> Result<(Option<Uuid>, Revert)> {
        self.service.controller().file(command.file_id)?;
        let conn = self.service.open_file(command.file_id).await?;
        Ok((Some(conn), Revert::CloseConnection(conn)))
    }

    async fn delete(&self, command: &LifecycleCommand) -> Result<(Option<Uuid>, Revert)> {
        self.service.controller().file(command.file_id)?;
        self.service.delete_file(command.file_id).await?;
        Ok((None, Revert::None))
    }

    fn reply(
        &self,
        command: &LifecycleCommand,
        connection_id: Option<Uuid>,
        err: Option<String>,
    ) -> LifecycleReply {
        LifecycleReply {
            id: command.id,
            host: self.public_host.clone(),
            connection_id,
            err,
        }
    }
}

/// Parse a raw command payload
pub fn decode_command(payload: &[u8]) -> Result<LifecycleCommand> {
    serde_json::from_slice(payload).map_err(Error::from)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{DeliveryOutcome, RecordingOrigin};
    use crate::service::ServiceConfig;
    use crate::storage::{InMemoryFileSystem, StorageController};
    use assert_matches::assert_matches;
    use std::path::Path;

    const ORIGIN: &str = "http://origin/replies";

    struct Fixture {
        handler: Arc<LifecycleHandler>,
        service: Arc<FileService>,
        origin: Arc<RecordingOrigin>,
    }

    async fn fixture(max: u64, seed: &[(Uuid, usize)]) -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        for (id, len) in seed {
            fs.insert(Path::new("/store").join(id.to_string()), vec![7u8; *len]);
        }
        let controller = StorageController::open("/store", max, fs).await.unwrap();
        let origin = Arc::new(RecordingOrigin::new());
        let service = Arc::new(FileService::new(
            Arc::new(controller),
            origin.clone(),
            ServiceConfig::default(),
        ));
        let handler = Arc::new(LifecycleHandler::new(
            Arc::clone(&service),
            origin.clone(),
            "store-1",
        ));
        Fixture {
            handler,
            service,
            origin,
        }
    }

    fn command(kind: CommandKind, file_id: Uuid, size: u64) -> LifecycleCommand {
        LifecycleCommand {
            id: Uuid::new_v4(),
            host: ORIGIN.into(),
            kind,
            file_id,
            size,
        }
    }

    #[tokio::test]
    async fn test_create_replies_with_connection() {
        let f = fixture(100, &[]).await;
        let file_id = Uuid::new_v4();
        let cmd = command(CommandKind::Create, file_id, 10);

        assert_eq!(f.handler.handle(cmd.clone()).await.unwrap(), ReplyAck::Accepted);

        let replies = f.origin.replies();
        assert_eq!(replies.len(), 1);
        let (host, reply) = &replies[0];
        assert_eq!(host, ORIGIN);
        assert_eq!(reply.id, cmd.id);
        assert_eq!(reply.host, "store-1");
        assert!(reply.err.is_none());
        let conn = reply.connection_id.unwrap();
        assert!(f.service.writers().contains(conn));
        assert!(f.service.controller().contains(file_id));
    }

    #[tokio::test]
    async fn test_create_over_capacity_replies_error() {
        let f = fixture(100, &[]).await;
        let file_id = Uuid::new_v4();

        f.handler
            .handle(command(CommandKind::Create, file_id, 101))
            .await
            .unwrap();

        let (_, reply) = &f.origin.replies()[0];
        assert!(reply.err.as_deref().unwrap().contains("Quota exceeded"));
        assert!(reply.connection_id.is_none());
        assert!(!f.service.controller().contains(file_id));
    }

    #[tokio::test]
    async fn test_reset_content_reverts_create() {
        let f = fixture(100, &[]).await;
        let file_id = Uuid::new_v4();
        f.origin.push_outcome(DeliveryOutcome::Ack(ReplyAck::Reset));

        let ack = f
            .handler
            .handle(command(CommandKind::Create, file_id, 10))
            .await
            .unwrap();
        assert_eq!(ack, ReplyAck::Reset);
        assert!(!f.service.controller().contains(file_id));
    }

    #[tokio::test]
    async fn test_unreachable_origin_reverts_open() {
        let file_id = Uuid::new_v4();
        let f = fixture(100, &[(file_id, 20)]).await;
        f.origin.push_outcome(DeliveryOutcome::Unreachable);

        assert!(f
            .handler
            .handle(command(CommandKind::Open, file_id, 0))
            .await
            .is_err());

        let (_, reply) = &f.origin.replies()[0];
        let conn = reply.connection_id.unwrap();
        assert!(!f.service.readers().contains(conn));
        // the object itself is untouched
        assert!(f.service.controller().contains(file_id));
    }

    #[tokio::test]
    async fn test_update_requires_existing_file() {
        let f = fixture(100, &[]).await;
        let (reply, revert) = f
            .handler
            .process(&command(CommandKind::Update, Uuid::new_v4(), 1))
            .await;
        assert!(reply.err.unwrap().contains("Not found"));
        assert_eq!(revert, Revert::None);
    }

    #[tokio::test]
    async fn test_update_opens_write_connection() {
        let file_id = Uuid::new_v4();
        let f = fixture(100, &[(file_id, 20)]).await;

        let (reply, revert) = f
            .handler
            .process(&command(CommandKind::Update, file_id, 50))
            .await;
        assert!(reply.err.is_none());
        assert_eq!(revert, Revert::None);
        assert!(f.service.writers().contains(reply.connection_id.unwrap()));
    }

    #[tokio::test]
    async fn test_delete_command() {
        let file_id = Uuid::new_v4();
        let f = fixture(100, &[(file_id, 20)]).await;

        let (reply, _) = f
            .handler
            .process(&command(CommandKind::Delete, file_id, 0))
            .await;
        assert!(reply.err.is_none());
        assert!(reply.connection_id.is_none());
        assert_eq!(f.service.controller().ledger().current(), 0);

        let (reply, _) = f
            .handler
            .process(&command(CommandKind::Delete, file_id, 0))
            .await;
        assert!(reply.err.is_some());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let f = fixture(100, &[]).await;
        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&f.handler).run(rx, shutdown.clone()));

        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            tx.send(command(CommandKind::Create, *id, 1)).await.unwrap();
        }
        drop(tx);
        runner.await.unwrap();

        assert_eq!(f.origin.replies().len(), 4);
        for id in ids {
            assert!(f.service.controller().contains(id));
        }
    }

    #[test]
    fn test_decode_command() {
        let payload = format!(
            r#"{{"id":"{}","host":"h","type":"open","file_id":"{}"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let cmd = decode_command(payload.as_bytes()).unwrap();
        assert_eq!(cmd.kind, CommandKind::Open);
        assert_matches!(decode_command(b"not json"), Err(Error::Serialization(_)));
    }
}
