//! Domain Layer
//!
//! Lifecycle command value objects and the ports the store uses to reach
//! origin hosts.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for outbound calls

pub mod ports;

pub use ports::{
    // Port traits
    OriginNotifier,
    ReplySink,
    // Value objects
    CommandKind,
    LifecycleCommand,
    LifecycleReply,
    ReplyAck,
};
