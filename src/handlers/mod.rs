//! Inbound transports
//!
//! - **Lifecycle** (`lifecycle.rs`) - Commands from origin hosts, replies with compensation
//! - **REST** (`rest.rs`) - Direct byte transfers over connection ids

pub mod lifecycle;
pub mod rest;

pub use lifecycle::{decode_command, LifecycleHandler, Revert};
pub use rest::{byte_range, status_for, ByteRange, RestConfig, RestHandler};
