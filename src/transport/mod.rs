//! # Transport Abstraction Module
//!
//! This module defines the minimal capability surface the bus core consumes
//! from any transport, together with the configuration record and the factory
//! that builds concrete transports.
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │     Facade      │───▶│    Transport     │───▶│    Specific     │
//! │  (Bus, Queue,   │    │      trait       │    │ implementation  │
//! │   RPC layer)    │◀───│  (abstraction)   │◀───│ (mem/broker/mq) │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! A transport must provide: fire-and-forget publish to a channel,
//! subscription management for exact channels (and glob patterns where the
//! primitive supports them), named FIFO queue operations with blocking,
//! timed, and non-blocking variants, and an asynchronous delivery callback
//! invoked once per received message.
//!
//! Transports differ in what they can honor and self-report through
//! [`Capabilities`]; an operation outside the active transport's
//! capabilities fails with [`BusError::Unsupported`] instead of silently
//! degrading.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::defaults;
use crate::error::BusError;

pub mod broker;
pub mod memory;
#[cfg(target_os = "linux")]
pub mod posix_mq;

pub use broker::BrokerTransport;
pub use memory::MemoryTransport;
#[cfg(target_os = "linux")]
pub use posix_mq::PosixMqTransport;

/// One message handed from a transport to the dispatcher.
///
/// `pattern` is set when the transport routed the message through a pattern
/// subscription; exact and pattern routes are dispatched independently.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel the message was published on
    pub channel: String,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Pattern the message matched, for pattern-routed deliveries
    pub pattern: Option<String>,
}

/// Delivery callback wired in at transport start; must be safe to invoke
/// from the transport's background tasks
pub type DeliveryFn = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A subscription target: an exact channel or a glob-style pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Exact channel name
    Exact(String),
    /// Glob-style channel pattern (`orders.*`)
    Pattern(String),
}

impl Topic {
    /// The channel or pattern string
    pub fn name(&self) -> &str {
        match self {
            Topic::Exact(name) | Topic::Pattern(name) => name,
        }
    }

    /// Whether this topic is a pattern subscription
    pub fn is_pattern(&self) -> bool {
        matches!(self, Topic::Pattern(_))
    }
}

/// How long a queue operation may wait for room or an item
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    /// Block until the operation can proceed
    Forever,
    /// Block up to the given duration, then fail
    Timeout(Duration),
    /// Fail immediately if the operation cannot proceed
    NoWait,
}

/// What the active transport can and cannot honor
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Glob-style pattern subscriptions
    pub patterns: bool,
    /// Visibility across process boundaries
    pub cross_process: bool,
    /// Visibility across host boundaries
    pub cross_host: bool,
    /// Exact queue length queries
    pub queue_len: bool,
}

/// Transport configuration for all providers.
///
/// Not every parameter applies to every transport: broker parameters are
/// ignored by the in-memory and POSIX transports, and vice versa.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Connection URL for the shared broker (`redis://host:port`),
    /// credentials included in the URL where required
    pub broker_url: String,

    /// Prefix applied to broker channels and queue keys so several buses can
    /// share one broker
    pub channel_prefix: String,

    /// Rendezvous directory for the POSIX IPC transport; subscription
    /// registrations live under it
    pub ipc_dir: PathBuf,

    /// Permission bits for kernel queue objects created by the POSIX
    /// transport
    pub ipc_mode: u32,

    /// Maximum number of messages a kernel queue may hold
    pub queue_depth: usize,

    /// Maximum size of an individual transport message in bytes
    pub max_msg_size: usize,

    /// Bound for in-memory named queues; `None` leaves them unbounded
    pub memory_queue_bound: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: defaults::BROKER_URL.to_string(),
            channel_prefix: defaults::CHANNEL_PREFIX.to_string(),
            ipc_dir: PathBuf::from(defaults::IPC_DIR),
            ipc_mode: defaults::IPC_MODE,
            queue_depth: defaults::QUEUE_DEPTH,
            max_msg_size: defaults::MAX_MESSAGE_SIZE,
            memory_queue_bound: None,
        }
    }
}

/// The capability set the bus core requires of a transport driver.
///
/// All methods take `&self`: a transport is shared between the facade and
/// its own background tasks, and manages interior state accordingly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name for logs and error messages
    fn name(&self) -> &'static str;

    /// Self-reported capability set
    fn capabilities(&self) -> Capabilities;

    /// Begin the background delivery loop, wiring `on_delivery` as the sink
    /// for incoming messages
    async fn start(&self, on_delivery: DeliveryFn) -> Result<(), BusError>;

    /// Stop the delivery loop and release transport resources; idempotent
    async fn stop(&self) -> Result<(), BusError>;

    /// Fire-and-forget delivery to current subscribers of `channel`
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Begin asynchronous delivery for this topic; idempotent per topic
    async fn subscribe(&self, topic: &Topic) -> Result<(), BusError>;

    /// Stop future deliveries for this topic; in-flight deliveries may still
    /// arrive
    async fn unsubscribe(&self, topic: &Topic) -> Result<(), BusError>;

    /// Append an item to the named FIFO queue, creating it on first use
    async fn queue_put(&self, queue: &str, item: &[u8], wait: Wait) -> Result<(), BusError>;

    /// Remove and return the oldest item of the named FIFO queue
    async fn queue_get(&self, queue: &str, wait: Wait) -> Result<Vec<u8>, BusError>;

    /// Current length of the named queue, where the transport can answer
    async fn queue_len(&self, queue: &str) -> Result<usize, BusError>;
}

/// Selector for the built-in transport providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Single-process dispatcher, no cross-process visibility
    InMemory,
    /// Shared Redis-protocol broker, cross-process and cross-host
    Broker,
    /// POSIX message-queue mesh, single host (Linux)
    #[cfg(target_os = "linux")]
    PosixMq,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::InMemory => "in-memory",
            Provider::Broker => "broker",
            #[cfg(target_os = "linux")]
            Provider::PosixMq => "posix-mq",
        };
        f.write_str(name)
    }
}

/// Factory for transport instances.
///
/// Construction is asynchronous because broker-backed transports establish
/// their connections up front.
pub struct TransportFactory;

impl TransportFactory {
    /// Build a transport for the given provider
    pub async fn create(
        provider: Provider,
        config: &BusConfig,
    ) -> Result<Arc<dyn Transport>, BusError> {
        match provider {
            Provider::InMemory => Ok(Arc::new(MemoryTransport::new(config))),
            Provider::Broker => Ok(Arc::new(BrokerTransport::connect(config).await?)),
            #[cfg(target_os = "linux")]
            Provider::PosixMq => Ok(Arc::new(PosixMqTransport::new(config)?)),
        }
    }
}
