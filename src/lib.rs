//! Stratus Store - quota-bounded local object store
//!
//! Keeps objects as flat files named by UUID under one root directory and
//! hands out short-lived read/write connections to clients that move the
//! bytes directly.
//!
//! # Architecture
//!
//! ```text
//!  origin host ──command──► LifecycleHandler ──reply──► origin host
//!                                 │
//!  client ──HTTP──► RestHandler ──┼──► FileService ──► StorageController
//!                                 │        │                 │
//!                                 │    Connector x2      FileHandle
//!                                 │  (readers/writers)   Reader / Writer
//!                                 │                          │
//!                                 │                     QuotaLedger
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Origin HTTP client and an in-memory recording origin
//! - [`connector`] - Time-boxed connection pools with background disposal
//! - [`domain`] - Lifecycle command types and outbound ports
//! - [`error`] - Error types
//! - [`handlers`] - Lifecycle command dispatcher and HTTP server
//! - [`metrics`] - Prometheus collectors
//! - [`service`] - Use cases and failed-write compensation
//! - [`storage`] - Quota ledger, versioned handles, buffered reader/writer

pub mod adapters;
pub mod connector;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use connector::{Closable, Connector, DisposalConfig, DisposalTask};
pub use domain::{CommandKind, LifecycleCommand, LifecycleReply};
pub use error::{Error, Result};
pub use handlers::{LifecycleHandler, RestConfig, RestHandler};
pub use service::{FileService, ServiceConfig};
pub use storage::{FileHandle, FileReader, FileWriter, QuotaLedger, StorageController};
