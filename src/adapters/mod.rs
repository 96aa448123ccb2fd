//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │              Ports: OriginNotifier │ ReplySink                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │          HttpOriginClient (reqwest) │ RecordingOrigin            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod origin;
mod recording;

pub use origin::{object_url, HttpOriginClient, OriginConfig};
pub use recording::{DeliveryOutcome, RecordingOrigin};
