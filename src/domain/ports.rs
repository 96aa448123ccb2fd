//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over the outside world the store talks to. The core only
//! depends on these traits; `adapters` provides the HTTP implementation and
//! a recording fake for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Service / Lifecycle Layer                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │          OriginNotifier    │    ReplySink            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │         HttpOriginClient   │   RecordingOrigin               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Kind of lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Register a new object and open it for writing
    Create,
    /// Reopen an existing object for writing
    Update,
    /// Open an existing object for reading
    Open,
    /// Remove an object
    Delete,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Create => write!(f, "create"),
            CommandKind::Update => write!(f, "update"),
            CommandKind::Open => write!(f, "open"),
            CommandKind::Delete => write!(f, "delete"),
        }
    }
}

/// Command sent by an origin host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCommand {
    /// Correlation id echoed in the reply
    pub id: Uuid,
    /// Origin host the reply goes to
    pub host: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub file_id: Uuid,
    /// Expected object size for create/update
    #[serde(default)]
    pub size: u64,
}

/// Reply delivered to the origin host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleReply {
    /// Id of the command being answered
    pub id: Uuid,
    /// Public host of this store
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl LifecycleReply {
    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

/// How the origin acknowledged a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAck {
    /// Reply taken as is
    Accepted,
    /// Origin asked to undo the command (HTTP 205 Reset Content)
    Reset,
}

// =============================================================================
// Ports
// =============================================================================

/// Callback to the origin host owning an object.
#[async_trait]
pub trait OriginNotifier: Send + Sync {
    /// Tell `host` that object `id` is corrupt and must be deregistered
    async fn object_failed(&self, host: &str, id: Uuid) -> Result<()>;
}

/// Delivery of lifecycle replies.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Post `reply` to `host`
    async fn deliver(&self, host: &str, reply: &LifecycleReply) -> Result<ReplyAck>;
}

// =============================================================================
// Tests
// =============================================================================
