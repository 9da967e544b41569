//! # Wirebus
//!
//! A message-oriented middleware library that unifies three remoting styles
//! behind a single API: publish/subscribe, named work queues, and synchronous
//! request/response RPC. All three run over pluggable transports:
//!
//! - **In-memory**: a single-process dispatcher, suitable for tests and
//!   in-process decoupling.
//! - **Shared broker**: a Redis-protocol broker, cross-process and cross-host,
//!   with glob-style pattern subscriptions.
//! - **POSIX IPC**: a kernel message-queue mesh for single-host process
//!   groups (Linux).
//!
//! The facade presents identical semantics regardless of the transport
//! underneath; operations a transport cannot honor fail with
//! [`BusError::Unsupported`] rather than silently degrading.

pub mod bus;
pub mod codec;
pub mod error;
pub mod event;
pub mod global;
pub mod queue;
pub mod rpc;
pub mod transport;

mod dispatch;

pub use bus::Bus;
pub use dispatch::SubscriptionId;
pub use error::{BusError, BusResult};
pub use event::Event;
pub use queue::Queue;
pub use rpc::{rpc_address, RpcResponse, Stub};
pub use transport::{
    BusConfig, Capabilities, Provider, Topic, Transport, TransportFactory, Wait,
};

/// The current version of the wirebus library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default shared-broker connection URL
    pub const BROKER_URL: &str = "redis://127.0.0.1:6379";

    /// Default prefix applied to broker channels and queue keys
    pub const CHANNEL_PREFIX: &str = "wirebus";

    /// Default rendezvous directory for the POSIX IPC transport
    pub const IPC_DIR: &str = "/tmp/wirebus";

    /// Default permission bits for kernel queue objects
    pub const IPC_MODE: u32 = 0o660;

    /// Default depth of kernel message queues
    pub const QUEUE_DEPTH: usize = 10;

    /// Default maximum transport message size in bytes
    pub const MAX_MESSAGE_SIZE: usize = 8192;

    /// Default collection window for multi-responder RPC calls
    pub const MULTI_CALL_TIMEOUT: Duration = Duration::from_secs(2);
}
